//! Connection supervisor.
//!
//! Owns a thread running the session against a real socket: it connects,
//! feeds received lines to the `Session`, writes queued commands out, and
//! reconnects with a fixed delay when the transport drops. Consecutive
//! failed attempts with no successful handshake in between stop automatic
//! reconnection once they reach a ceiling; an explicit `reconnect()`
//! resets the counter and tries again. Consumers talk to the thread
//! through a `Supervisor` handle.

use crate::hep::port::{Port, RecvError};
use crate::session::{Session, SessionEvent, StateDump};

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;

/// Consecutive failed connection attempts after which automatic
/// reconnection stops.
pub const RECONNECT_FAILURE_CEILING: u32 = 60;

/// Delay before re-attempting a connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Timeout for a single TCP connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// What to do after the transport closed or an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectAction {
    Retry(Duration),
    GiveUp,
}

/// Failure counting for the reconnect loop. A close that ends an actual
/// session resets the counter, a close before a successful open counts
/// as a failed attempt.
struct ReconnectPolicy {
    failures: u32,
}

impl ReconnectPolicy {
    fn new() -> ReconnectPolicy {
        ReconnectPolicy { failures: 0 }
    }

    fn closed(&mut self, was_active: bool) -> ReconnectAction {
        if was_active {
            self.failures = 0;
        } else {
            self.failures += 1;
        }
        if self.failures >= RECONNECT_FAILURE_CEILING {
            ReconnectAction::GiveUp
        } else {
            ReconnectAction::Retry(RECONNECT_DELAY)
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Requests from the handle to the supervisor thread.
enum Request {
    Set { name: String, value: String },
    Refresh,
    Reconnect,
    Dump(channel::Sender<StateDump>),
    Shutdown,
}

/// The supervisor thread is gone.
#[derive(Debug)]
pub struct SupervisorGone;

/// Supervisor configuration.
pub struct Config {
    /// Controller address, see `hep::port::resolve_url`.
    pub url: String,
    /// Whether to run the trace replay phase and maintain chart buffers.
    pub charting: bool,
}

/// State owned by the supervisor thread.
struct Core {
    config: Config,
    session: Session,
    policy: ReconnectPolicy,
    requests: channel::Receiver<Request>,
    events: channel::Sender<SessionEvent>,
    link: Option<(Port, channel::Receiver<Result<String, RecvError>>)>,
    retry_at: Option<Instant>,
}

fn try_connect(url: &str) -> io::Result<(Port, channel::Receiver<Result<String, RecvError>>)> {
    let (rx_send, rx) = Port::rx_channel();
    let port = Port::connect(url, CONNECT_TIMEOUT, Port::rx_to_channel(rx_send))?;
    Ok((port, rx))
}

impl Core {
    fn run(&mut self) {
        use channel::TryRecvError;

        self.connect_now();

        'mainloop: loop {
            if !self.flush_commands() || !self.flush_events() {
                break;
            }

            // A due retry deadline takes priority over new I/O.
            if let Some(at) = self.retry_at {
                if Instant::now() >= at {
                    self.connect_now();
                    continue;
                }
            }
            let timeout = match self.retry_at {
                Some(at) => at.saturating_duration_since(Instant::now()),
                None => Duration::from_secs(60),
            };

            let mut sel = channel::Select::new();
            let requests_idx = sel.recv(&self.requests);
            let link_idx = self.link.as_ref().map(|(_, rx)| sel.recv(rx));

            let index = match sel.ready_timeout(timeout) {
                Ok(index) => index,
                Err(channel::ReadyTimeoutError) => continue,
            };

            if index == requests_idx {
                loop {
                    match self.requests.try_recv() {
                        Ok(Request::Set { name, value }) => self.session.set(&name, &value),
                        Ok(Request::Refresh) => self.session.refresh(),
                        Ok(Request::Reconnect) => {
                            self.policy.reset();
                            if self.link.is_some() {
                                self.link = None;
                                self.session.on_close();
                            }
                            self.connect_now();
                        }
                        Ok(Request::Dump(reply)) => {
                            let _ = reply.send(self.session.state_dump());
                        }
                        Ok(Request::Shutdown) | Err(TryRecvError::Disconnected) => {
                            break 'mainloop;
                        }
                        Err(TryRecvError::Empty) => {
                            break;
                        }
                    }
                }
            } else if Some(index) == link_idx {
                self.pump_link();
            }
        }
    }

    /// Drains received lines into the session. Channel exhaustion without
    /// disconnect is the normal case.
    fn pump_link(&mut self) {
        use channel::TryRecvError;

        let mut closed = false;
        if let Some((_, rx)) = &self.link {
            loop {
                match rx.try_recv() {
                    Ok(Ok(line)) => self.session.handle_line(&line),
                    Ok(Err(_)) | Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                    Err(TryRecvError::Empty) => {
                        break;
                    }
                }
            }
        }
        if closed {
            self.link_closed();
        }
    }

    /// Writes queued session commands to the port. Returns false when the
    /// event consumer is gone.
    fn flush_commands(&mut self) -> bool {
        while let Some(cmd) = self.session.next_command() {
            let failed = match &self.link {
                Some((port, _)) => port.send(cmd.to_string()).is_err(),
                None => false,
            };
            if failed {
                self.link_closed();
                return self.flush_events();
            }
        }
        true
    }

    /// Forwards pending session events to the handle. Returns false when
    /// the consumer dropped the receiving side.
    fn flush_events(&mut self) -> bool {
        for event in self.session.drain_events() {
            if self.events.send(event).is_err() {
                return false;
            }
        }
        true
    }

    fn connect_now(&mut self) {
        self.retry_at = None;
        match try_connect(&self.config.url) {
            Ok(link) => {
                self.link = Some(link);
                self.session.on_open();
            }
            Err(_) => {
                self.schedule_retry(false);
            }
        }
    }

    fn link_closed(&mut self) {
        self.link = None;
        let was_active = self.session.on_close();
        self.schedule_retry(was_active);
    }

    fn schedule_retry(&mut self, was_active: bool) {
        match self.policy.closed(was_active) {
            ReconnectAction::Retry(delay) => {
                self.retry_at = Some(Instant::now() + delay);
            }
            ReconnectAction::GiveUp => {
                self.retry_at = None;
                // Session events first so the disconnect precedes the
                // exhaustion notification.
                if self.flush_events() {
                    let _ = self.events.send(SessionEvent::ReconnectExhausted);
                }
            }
        }
    }
}

/// Handle to a supervisor thread. Dropping it shuts the thread down.
pub struct Supervisor {
    requests: channel::Sender<Request>,
    events: channel::Receiver<SessionEvent>,
}

impl Supervisor {
    /// Starts a supervisor with charting enabled.
    pub fn new(url: &str) -> Supervisor {
        Supervisor::with_config(Config {
            url: url.to_string(),
            charting: true,
        })
    }

    pub fn with_config(config: Config) -> Supervisor {
        let (req_send, req_recv) = channel::bounded::<Request>(32);
        let (ev_send, ev_recv) = channel::unbounded::<SessionEvent>();
        let charting = config.charting;
        thread::spawn(move || {
            Core {
                config,
                session: Session::new(charting),
                policy: ReconnectPolicy::new(),
                requests: req_recv,
                events: ev_send,
                link: None,
                retry_at: None,
            }
            .run();
        });
        Supervisor {
            requests: req_send,
            events: ev_recv,
        }
    }

    /// The stream of session events, to receive from directly or via
    /// `crossbeam::channel::select!`.
    pub fn events(&self) -> &channel::Receiver<SessionEvent> {
        &self.events
    }

    fn request(&self, req: Request) -> Result<(), SupervisorGone> {
        self.requests.send(req).map_err(|_| SupervisorGone)
    }

    /// Requests a sink signal change.
    pub fn set(&self, name: &str, value: &str) -> Result<(), SupervisorGone> {
        self.request(Request::Set {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Requests a fresh snapshot.
    pub fn refresh(&self) -> Result<(), SupervisorGone> {
        self.request(Request::Refresh)
    }

    /// Resets the failure counter and connects immediately, dropping any
    /// current connection.
    pub fn reconnect(&self) -> Result<(), SupervisorGone> {
        self.request(Request::Reconnect)
    }

    /// Retrieves a point-in-time copy of the session's data model.
    pub fn dump(&self) -> Result<StateDump, SupervisorGone> {
        let (reply_send, reply) = channel::bounded::<StateDump>(1);
        self.request(Request::Dump(reply_send))?;
        reply.recv().map_err(|_| SupervisorGone)
    }

    /// Stops the supervisor thread and closes the connection.
    pub fn shutdown(&self) -> Result<(), SupervisorGone> {
        self.request(Request::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    #[test]
    fn policy_gives_up_at_ceiling() {
        let mut policy = ReconnectPolicy::new();
        for _ in 0..RECONNECT_FAILURE_CEILING - 1 {
            assert_eq!(policy.closed(false), ReconnectAction::Retry(RECONNECT_DELAY));
        }
        assert_eq!(policy.closed(false), ReconnectAction::GiveUp);
        // Further failures stay exhausted
        assert_eq!(policy.closed(false), ReconnectAction::GiveUp);
    }

    #[test]
    fn active_close_resets_failure_count() {
        let mut policy = ReconnectPolicy::new();
        for _ in 0..RECONNECT_FAILURE_CEILING - 1 {
            policy.closed(false);
        }
        assert_eq!(policy.closed(true), ReconnectAction::Retry(RECONNECT_DELAY));
        assert_eq!(policy.closed(false), ReconnectAction::Retry(RECONNECT_DELAY));
    }

    #[test]
    fn reset_allows_retrying_after_exhaustion() {
        let mut policy = ReconnectPolicy::new();
        for _ in 0..RECONNECT_FAILURE_CEILING {
            policy.closed(false);
        }
        policy.reset();
        assert_eq!(policy.closed(false), ReconnectAction::Retry(RECONNECT_DELAY));
    }

    #[test]
    fn handshake_against_scripted_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut stream = stream;
            let mut line = String::new();

            reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim_end(), "props");
            stream.write_all(b"Version: 0.9\nT0: 1000\n.\n").unwrap();

            line.clear();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim_end(), "get");
            stream
                .write_all(b"source led-red - living.light on\n.\n")
                .unwrap();

            line.clear();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim_end(), "trace");
            stream.write_all(b".\n!living.light=0\n").unwrap();

            line.clear();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line.trim_end(), "set living.light=\"1\"");
        });

        let supervisor = Supervisor::with_config(Config {
            url: format!("tcp://{}", addr),
            charting: true,
        });
        let deadline = Duration::from_secs(10);
        let mut seen_ready = false;
        loop {
            match supervisor.events().recv_timeout(deadline).unwrap() {
                SessionEvent::SessionReady => seen_ready = true,
                SessionEvent::SignalChanged { name, value, .. }
                    if name == "living.light" && value == "0" =>
                {
                    break;
                }
                _ => {}
            }
        }
        assert!(seen_ready);

        let dump = supervisor.dump().unwrap();
        assert_eq!(dump.signals.len(), 1);
        assert_eq!(dump.signals[0].value, "0");

        supervisor.set("living.light", "1").unwrap();
        server.join().unwrap();
        supervisor.shutdown().unwrap();
    }
}
