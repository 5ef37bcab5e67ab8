//! Protocol session.
//!
//! `Session` is the protocol state machine: it consumes inbound text
//! chunks, interprets each decoded line according to the current state,
//! and maintains the signal registry and chart buffers. It performs no
//! I/O itself: the transport adapter calls `on_open`, `handle_chunk` and
//! `on_close`, drains queued commands from `next_command`, and consumers
//! drain notifications from `drain_events`. Multiple independent sessions
//! can exist side by side.

use crate::data::chart::{ChartSet, ChartSignal, TracePoint, DEFAULT_TRACE_DEPTH};
use crate::data::registry::{Signal, SignalRegistry, UpdateOutcome};
use crate::hep::line::LineCodec;
use crate::hep::proto::{self, Command, Direction, Widget};
use std::collections::VecDeque;

/// Protocol state. Exactly one is active at a time; it determines what
/// incoming lines mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No usable transport.
    Idle,
    /// `props` sent, consuming session properties.
    AwaitingSessionInfo,
    /// `get` sent, consuming snapshot records.
    AwaitingSnapshot,
    /// `trace` sent, consuming trace replay lines.
    AwaitingTraceReplay,
    /// Steady state, consuming live change events.
    Ready,
}

/// Notifications for the session's consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake complete, the registry is about to be repopulated.
    SessionReady,
    /// A signal was inserted or its value changed. Direction and widget
    /// are carried for snapshot upserts, live updates leave them None.
    SignalChanged {
        name: String,
        value: String,
        direction: Option<Direction>,
        widget: Option<Widget>,
    },
    /// An alignment or replay pass changed the named chart's traces.
    ChartDataChanged(String),
    ConnectionChanged(bool),
    /// The remote view went stale and a fresh snapshot was requested.
    RefreshRequested,
    /// A line was dropped. Never changes session state.
    ProtocolError(proto::Error),
    /// The reconnect failure ceiling was reached, no more automatic
    /// attempts will be made.
    ReconnectExhausted,
}

/// Session properties announced after connect, in announcement order.
pub struct SessionProps {
    entries: Vec<(String, String)>,
    t0: Option<i64>,
}

impl SessionProps {
    fn new() -> SessionProps {
        SessionProps {
            entries: Vec::new(),
            t0: None,
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.t0 = None;
    }

    fn set(&mut self, key: String, value: String) {
        if key == "T0" {
            self.t0 = value.parse::<i64>().ok();
        }
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Epoch of the session clock, in milliseconds. Anchors all relative
    /// trace and event ticks.
    pub fn t0(&self) -> Option<i64> {
        self.t0
    }

    /// Trace depth announced by the controller, or the default.
    pub fn depth(&self) -> usize {
        self.get("Depth")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_TRACE_DEPTH)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Protocol state machine with the session's data model.
pub struct Session {
    state: SessionState,
    charting: bool,
    codec: LineCodec,
    props: SessionProps,
    registry: SignalRegistry,
    charts: ChartSet,
    events: VecDeque<SessionEvent>,
    outbox: VecDeque<Command>,
}

impl Session {
    /// Creates an idle session. With `charting` disabled the trace replay
    /// phase is skipped and live events only touch the registry.
    pub fn new(charting: bool) -> Session {
        Session {
            state: SessionState::Idle,
            charting,
            codec: LineCodec::new(),
            props: SessionProps::new(),
            registry: SignalRegistry::new(),
            charts: ChartSet::new(),
            events: VecDeque::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn props(&self) -> &SessionProps {
        &self.props
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    pub fn charts(&self) -> &ChartSet {
        &self.charts
    }

    /// The transport connected. Starts the handshake.
    pub fn on_open(&mut self) {
        self.codec.reset();
        self.outbox.clear();
        self.outbox.push_back(Command::Props);
        self.state = SessionState::AwaitingSessionInfo;
    }

    /// The transport closed. Returns whether a session was actually in
    /// progress, which the reconnect policy uses to tell a dropped session
    /// from a failed connection attempt.
    pub fn on_close(&mut self) -> bool {
        let was_active = self.state != SessionState::Idle;
        if was_active {
            self.events.push_back(SessionEvent::ConnectionChanged(false));
        }
        self.state = SessionState::Idle;
        self.codec.reset();
        self.outbox.clear();
        was_active
    }

    /// Feeds an inbound chunk, which may contain any number of complete
    /// lines and at most one trailing partial line.
    pub fn handle_chunk(&mut self, chunk: &[u8]) {
        for line in self.codec.push(chunk) {
            self.handle_line(&line);
        }
    }

    /// Interprets one complete line in the current state.
    pub fn handle_line(&mut self, line: &str) {
        // Error reports can arrive in any phase and do not change state.
        if let Some(msg) = line.strip_prefix('.') {
            if !msg.is_empty() {
                self.events.push_back(SessionEvent::ProtocolError(
                    proto::Error::ServerError(msg.trim().to_string()),
                ));
                return;
            }
        }
        let terminator = line == ".";
        match self.state {
            SessionState::Idle => {
                self.events.push_back(SessionEvent::ProtocolError(
                    proto::Error::UnexpectedLine(line.to_string()),
                ));
            }
            SessionState::AwaitingSessionInfo => {
                if terminator {
                    self.finish_props();
                } else {
                    match proto::parse_prop(line) {
                        Ok((key, value)) => self.props.set(key, value),
                        Err(e) => self.events.push_back(SessionEvent::ProtocolError(e)),
                    }
                }
            }
            SessionState::AwaitingSnapshot => {
                if terminator {
                    self.finish_snapshot();
                } else {
                    match proto::parse_snapshot(line) {
                        Ok(rec) => {
                            if let Some(spec) = &rec.chart {
                                self.charts.add_signal(spec, &rec.name);
                            }
                            self.events.push_back(SessionEvent::SignalChanged {
                                name: rec.name.clone(),
                                value: rec.value.clone(),
                                direction: Some(rec.direction),
                                widget: Some(rec.widget.clone()),
                            });
                            self.registry.upsert(rec);
                        }
                        Err(e) => self.events.push_back(SessionEvent::ProtocolError(e)),
                    }
                }
            }
            SessionState::AwaitingTraceReplay => {
                if terminator {
                    self.state = SessionState::Ready;
                } else {
                    self.handle_trace_line(line);
                }
            }
            SessionState::Ready => match line.strip_prefix('!') {
                Some(body) => self.handle_event_line(line, body),
                None => {
                    self.events.push_back(SessionEvent::ProtocolError(
                        proto::Error::UnexpectedLine(line.to_string()),
                    ));
                }
            },
        }
    }

    fn finish_props(&mut self) {
        self.events.push_back(SessionEvent::ConnectionChanged(true));
        self.events.push_back(SessionEvent::SessionReady);
        // The one registry wipe of this connection. Refresh snapshots later
        // in the session only upsert.
        self.registry.clear();
        self.charts.clear();
        self.outbox.push_back(Command::Get(None));
        self.state = SessionState::AwaitingSnapshot;
    }

    fn finish_snapshot(&mut self) {
        if self.charting {
            self.charts.init(self.props.depth());
            self.outbox.push_back(Command::Trace);
            self.state = SessionState::AwaitingTraceReplay;
        } else {
            self.state = SessionState::Ready;
        }
    }

    fn handle_trace_line(&mut self, line: &str) {
        let rec = match proto::parse_trace(line) {
            Ok(rec) => rec,
            Err(e) => {
                self.events.push_back(SessionEvent::ProtocolError(e));
                return;
            }
        };
        let t0 = match self.props.t0() {
            Some(t0) => t0,
            None => {
                self.events.push_back(SessionEvent::ProtocolError(
                    proto::Error::MissingTimeBase(line.to_string()),
                ));
                return;
            }
        };
        let points: Vec<TracePoint> = rec
            .samples
            .into_iter()
            .map(|s| TracePoint {
                t: t0 + s.offset,
                y: s.value,
                ext: s.ext,
            })
            .collect();
        if let Some(chart) = self.charts.replace_trace(&rec.name, points) {
            let chart = chart.to_string();
            self.events.push_back(SessionEvent::ChartDataChanged(chart));
        }
    }

    fn handle_event_line(&mut self, line: &str, body: &str) {
        let rec = match proto::parse_event(body) {
            Ok(rec) => rec,
            Err(e) => {
                self.events.push_back(SessionEvent::ProtocolError(e));
                return;
            }
        };
        match self.registry.update(&rec.name, &rec.value) {
            UpdateOutcome::Updated => {}
            UpdateOutcome::Unknown => {
                // The remote knows a signal we never saw: our view is stale,
                // fetch a fresh snapshot.
                self.events.push_back(SessionEvent::RefreshRequested);
                self.outbox.push_back(Command::Get(None));
                self.state = SessionState::AwaitingSnapshot;
                return;
            }
        }
        self.events.push_back(SessionEvent::SignalChanged {
            name: rec.name.clone(),
            value: rec.value.clone(),
            direction: None,
            widget: None,
        });
        if !self.charting {
            return;
        }
        if let Some(tick) = rec.tick {
            let t0 = match self.props.t0() {
                Some(t0) => t0,
                None => {
                    self.events.push_back(SessionEvent::ProtocolError(
                        proto::Error::MissingTimeBase(line.to_string()),
                    ));
                    return;
                }
            };
            let pt = TracePoint {
                t: t0 + tick,
                y: rec.value,
                ext: false,
            };
            if let Some(chart) = self.charts.append(&rec.name, pt) {
                let chart = chart.to_string();
                self.events.push_back(SessionEvent::ChartDataChanged(chart));
            }
        }
    }

    /// Queues a value change request for a sink signal.
    pub fn set(&mut self, name: &str, value: &str) {
        self.outbox.push_back(Command::Set {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// Requests a fresh snapshot. Only possible in steady state: during the
    /// bulk phases the protocol is half duplex and a request is already in
    /// flight.
    pub fn refresh(&mut self) {
        if self.state == SessionState::Ready {
            self.events.push_back(SessionEvent::RefreshRequested);
            self.outbox.push_back(Command::Get(None));
            self.state = SessionState::AwaitingSnapshot;
        }
    }

    /// Dequeues the next command to write to the transport.
    pub fn next_command(&mut self) -> Option<Command> {
        self.outbox.pop_front()
    }

    /// Drains all pending notifications, in order.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    /// Snapshot of the whole session for out-of-thread consumers.
    pub fn state_dump(&self) -> StateDump {
        StateDump {
            state: self.state,
            props: self
                .props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            signals: self.registry.iter().cloned().collect(),
            charts: self
                .charts
                .charts()
                .iter()
                .map(|chart| ChartDump {
                    name: chart.name.clone(),
                    signals: chart.signals.clone(),
                    traces: chart
                        .signals
                        .iter()
                        .map(|s| {
                            (
                                s.name.clone(),
                                self.charts
                                    .trace(&s.name)
                                    .map(|tr| tr.points.iter().cloned().collect())
                                    .unwrap_or_default(),
                            )
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Point-in-time copy of a session's data model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDump {
    pub state: SessionState,
    pub props: Vec<(String, String)>,
    pub signals: Vec<Signal>,
    pub charts: Vec<ChartDump>,
}

/// Point-in-time copy of one chart, with traces keyed by leaf name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartDump {
    pub name: String,
    pub signals: Vec<ChartSignal>,
    pub traces: Vec<(String, Vec<TracePoint>)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(session: &mut Session, lines: &[&str]) {
        for line in lines {
            session.handle_line(line);
        }
    }

    fn open_through_props(session: &mut Session, t0: i64) {
        session.on_open();
        assert_eq!(session.next_command(), Some(Command::Props));
        let t0_line = format!("T0: {}", t0);
        feed(
            session,
            &[
                "Version: 0.9",
                "Arch: armv7",
                "Depth: 500",
                t0_line.as_str(),
                ".",
            ],
        );
        assert_eq!(session.next_command(), Some(Command::Get(None)));
    }

    fn open_through_snapshot(session: &mut Session, t0: i64) {
        open_through_props(session, t0);
        feed(
            session,
            &[
                "source led-red - living.light on",
                "source meter:min=0,max=50 climate living.temp 20.5",
                "source meter climate living.hum 55",
                "sink switch-slide - hall.lamp 0",
                ".",
            ],
        );
    }

    #[test]
    fn handshake_walks_all_phases() {
        let mut session = Session::new(true);
        assert_eq!(session.state(), SessionState::Idle);
        open_through_snapshot(&mut session, 1000);
        assert_eq!(session.state(), SessionState::AwaitingTraceReplay);
        assert_eq!(session.next_command(), Some(Command::Trace));
        feed(&mut session, &["temp 0,20.5 +120,21.0", "."]);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.props().t0(), Some(1000));
        assert_eq!(session.props().get("Version"), Some("0.9"));
        assert_eq!(session.registry().len(), 4);
    }

    #[test]
    fn charting_disabled_skips_trace_replay() {
        let mut session = Session::new(false);
        open_through_snapshot(&mut session, 1000);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.next_command(), None);
    }

    #[test]
    fn session_ready_emitted_at_props_terminator() {
        let mut session = Session::new(true);
        open_through_props(&mut session, 1000);
        let events = session.drain_events();
        assert_eq!(events[0], SessionEvent::ConnectionChanged(true));
        assert_eq!(events[1], SessionEvent::SessionReady);
    }

    #[test]
    fn trace_timestamps_anchor_to_t0() {
        let mut session = Session::new(true);
        open_through_snapshot(&mut session, 1000);
        feed(&mut session, &["temp 0,20.5 +120,21.0", "."]);
        let trace = session.charts().trace("living.temp").unwrap();
        let points: Vec<TracePoint> = trace.points.iter().cloned().collect();
        assert_eq!(
            points,
            vec![
                TracePoint {
                    t: 1000,
                    y: "20.5".to_string(),
                    ext: false
                },
                TracePoint {
                    t: 1120,
                    y: "21.0".to_string(),
                    ext: true
                },
            ]
        );
    }

    #[test]
    fn live_event_updates_registry_and_keeps_metadata() {
        let mut session = Session::new(true);
        open_through_snapshot(&mut session, 1000);
        feed(&mut session, &["."]);
        session.drain_events();
        feed(&mut session, &["!living.light=0"]);
        let signal = session.registry().get("living.light").unwrap();
        assert_eq!(signal.value, "0");
        assert_eq!(signal.direction, Direction::Source);
        assert_eq!(
            signal.widget,
            Widget::Led {
                style: "red".to_string()
            }
        );
        assert_eq!(
            session.drain_events(),
            vec![SessionEvent::SignalChanged {
                name: "living.light".to_string(),
                value: "0".to_string(),
                direction: None,
                widget: None,
            }]
        );
    }

    #[test]
    fn ticked_event_appends_to_chart_with_alignment() {
        let mut session = Session::new(true);
        open_through_snapshot(&mut session, 1000);
        feed(
            &mut session,
            &["temp 0,20.5", "hum 0,55", ".", "!500,living.temp=21.0"],
        );
        session.drain_events();
        let temp = session.charts().trace("living.temp").unwrap();
        assert_eq!(temp.points.back().unwrap().t, 1500);
        assert!(!temp.points.back().unwrap().ext);
        // The other climate trace was extended to the same timestamp
        let hum = session.charts().trace("living.hum").unwrap();
        assert_eq!(hum.points.back().unwrap().t, 1500);
        assert!(hum.points.back().unwrap().ext);
    }

    #[test]
    fn unknown_signal_event_triggers_refresh() {
        let mut session = Session::new(true);
        open_through_snapshot(&mut session, 1000);
        feed(&mut session, &["."]);
        session.drain_events();
        feed(&mut session, &["!porch.light=1"]);
        assert_eq!(
            session.drain_events(),
            vec![SessionEvent::RefreshRequested]
        );
        assert_eq!(session.next_command(), Some(Command::Get(None)));
        assert_eq!(session.state(), SessionState::AwaitingSnapshot);
        // The refresh snapshot only upserts, old entries survive
        feed(&mut session, &["source led-green - porch.light 1", "."]);
        assert_eq!(session.registry().len(), 5);
        assert!(session.registry().get("living.light").is_some());
    }

    #[test]
    fn replaying_identical_snapshot_is_idempotent() {
        let mut session = Session::new(false);
        open_through_snapshot(&mut session, 1000);
        let first = session.state_dump();
        session.on_close();
        open_through_snapshot(&mut session, 1000);
        let second = session.state_dump();
        assert_eq!(first.signals, second.signals);
        assert_eq!(first.charts, second.charts);
    }

    #[test]
    fn snapshot_replaces_stale_fields() {
        let mut session = Session::new(false);
        open_through_snapshot(&mut session, 1000);
        session.on_close();
        session.on_open();
        feed(&mut session, &["T0: 2000", "."]);
        feed(&mut session, &["sink slider - living.light 5", "."]);
        let signal = session.registry().get("living.light").unwrap();
        assert_eq!(signal.direction, Direction::Sink);
        assert_eq!(signal.widget, Widget::Slider { options: vec![] });
        assert_eq!(signal.value, "5");
        assert_eq!(session.registry().len(), 1);
    }

    #[test]
    fn unexpected_lines_drop_without_state_change() {
        let mut session = Session::new(true);
        open_through_snapshot(&mut session, 1000);
        feed(&mut session, &["."]);
        session.drain_events();
        feed(&mut session, &["garbage line"]);
        assert!(matches!(
            session.drain_events()[0],
            SessionEvent::ProtocolError(proto::Error::UnexpectedLine(_))
        ));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn server_error_lines_surface_in_any_phase() {
        let mut session = Session::new(true);
        session.on_open();
        feed(&mut session, &[".ERROR: no such command"]);
        assert_eq!(
            session.drain_events(),
            vec![SessionEvent::ProtocolError(proto::Error::ServerError(
                "ERROR: no such command".to_string()
            ))]
        );
        assert_eq!(session.state(), SessionState::AwaitingSessionInfo);
    }

    #[test]
    fn trace_line_without_t0_is_dropped() {
        let mut session = Session::new(true);
        session.on_open();
        feed(&mut session, &["Version: 0.9", "."]);
        feed(&mut session, &["source meter climate living.temp 20", "."]);
        session.drain_events();
        feed(&mut session, &["temp 0,20.5"]);
        assert!(matches!(
            session.drain_events()[0],
            SessionEvent::ProtocolError(proto::Error::MissingTimeBase(_))
        ));
        assert!(session
            .charts()
            .trace("living.temp")
            .unwrap()
            .points
            .is_empty());
    }

    #[test]
    fn close_resets_to_idle_and_reports_activity() {
        let mut session = Session::new(true);
        session.on_open();
        assert!(session.on_close());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.drain_events(), vec![]);
        // A second close without an open is a failed attempt, not a drop
        assert!(!session.on_close());
    }

    #[test]
    fn close_after_handshake_emits_disconnect() {
        let mut session = Session::new(true);
        open_through_props(&mut session, 1000);
        session.drain_events();
        assert!(session.on_close());
        assert_eq!(
            session.drain_events(),
            vec![SessionEvent::ConnectionChanged(false)]
        );
    }

    #[test]
    fn chunked_input_reassembles_lines() {
        let mut session = Session::new(false);
        session.on_open();
        session.handle_chunk(b"Version: 0.9\nT0: 10");
        session.handle_chunk(b"00\n.\n");
        assert_eq!(session.props().t0(), Some(1000));
        assert_eq!(session.state(), SessionState::AwaitingSnapshot);
    }

    #[test]
    fn set_and_refresh_queue_commands() {
        let mut session = Session::new(false);
        open_through_snapshot(&mut session, 1000);
        session.set("hall.lamp", "1");
        assert_eq!(
            session.next_command(),
            Some(Command::Set {
                name: "hall.lamp".to_string(),
                value: "1".to_string()
            })
        );
        session.refresh();
        assert_eq!(session.next_command(), Some(Command::Get(None)));
        assert_eq!(session.state(), SessionState::AwaitingSnapshot);
        // A refresh during a bulk phase is ignored
        session.refresh();
        assert_eq!(session.next_command(), None);
    }
}
