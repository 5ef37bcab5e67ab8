//! TCP transport for the line protocol.
//!
//! A `Port` owns a dedicated poller thread which bridges the `mio`
//! world of the nonblocking socket with crossbeam channels: received
//! lines are handed to an owned rx callback (usually one forwarding to
//! a channel, see `rx_to_channel`), and outbound lines are queued on an
//! internal channel and written out by the thread, with buffering when
//! the TCP send buffer fills up.

use super::line::LineCodec;
use std::collections::VecDeque;
use std::io;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

/// Default TCP port of the controller's events service.
pub static DEFAULT_PORT: u16 = 4640;

/// Possible errors when receiving from a `Port`.
#[derive(Debug)]
pub enum RecvError {
    /// No lines available at this time.
    NotReady,
    /// This port got disconnected.
    Disconnected,
    /// Low level IO error.
    IO(io::Error),
}

/// Possible errors when sending to a `Port`.
#[derive(Debug)]
pub enum SendError {
    /// A line was written out partially and the rest must be drained.
    /// Internal to the poller thread, never returned by a `Port`.
    MustDrain,
    /// The port outgoing queue is full.
    Full,
    /// This port is not connected.
    Disconnected,
    /// Issue with the underlying IO operation.
    IO(io::Error),
}

/// Outgoing buffer holding bytes the socket would not take yet.
struct TxBuf {
    buf: Vec<u8>,
}

impl TxBuf {
    fn new() -> TxBuf {
        TxBuf { buf: Vec::new() }
    }

    fn empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn add_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Sends as much of the contained data as possible to `writer`.
    fn drain<T: Write>(&mut self, writer: &mut T) -> Result<(), SendError> {
        while !self.buf.is_empty() {
            match writer.write(&self.buf) {
                Ok(size) => {
                    self.buf.drain(..size);
                }
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        return Err(SendError::MustDrain);
                    } else {
                        return Err(SendError::IO(e));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Low level nonblocking link: a TCP stream plus line reassembly on the
/// rx side and packetization buffering on the tx side.
struct TcpLink {
    stream: mio::net::TcpStream,
    codec: LineCodec,
    lines: VecDeque<String>,
    txbuf: TxBuf,
}

impl TcpLink {
    fn from_stream(stream: mio::net::TcpStream) -> TcpLink {
        TcpLink {
            stream,
            codec: LineCodec::new(),
            lines: VecDeque::new(),
            txbuf: TxBuf::new(),
        }
    }

    /// Returns a line without blocking, or `RecvError::NotReady` once the
    /// socket has been read dry. Never returns NotReady with unread socket
    /// data, which the edge signaling of the poller relies on.
    fn recv(&mut self) -> Result<String, RecvError> {
        loop {
            if let Some(line) = self.lines.pop_front() {
                return Ok(line);
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(RecvError::Disconnected);
                }
                Ok(size) => {
                    self.lines.extend(self.codec.push(&chunk[..size]));
                }
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        return Err(RecvError::NotReady);
                    } else {
                        return Err(RecvError::IO(e));
                    }
                }
            }
        }
    }

    /// Attempts to write out a line with its terminator. On `MustDrain`
    /// the remainder sits in the tx buffer and `drain()` must succeed
    /// before any further send.
    fn send(&mut self, line: &str) -> Result<(), SendError> {
        if self.has_data_to_drain() {
            return Err(SendError::Full);
        }
        let mut raw = line.as_bytes().to_vec();
        raw.push(b'\n');
        match self.stream.write(&raw) {
            Ok(size) => {
                if size == raw.len() {
                    Ok(())
                } else {
                    self.txbuf.add_data(&raw[size..]);
                    Err(SendError::MustDrain)
                }
            }
            Err(err) => {
                match err.kind() {
                    // These can occur when a line is sent right after the
                    // nonblocking connection is initiated and before the
                    // handshake completes, or with the TCP buffer full.
                    io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected => {
                        self.txbuf.add_data(&raw);
                        Err(SendError::MustDrain)
                    }
                    _ => Err(SendError::IO(err)),
                }
            }
        }
    }

    fn drain(&mut self) -> Result<(), SendError> {
        self.txbuf.drain(&mut self.stream)
    }

    fn has_data_to_drain(&self) -> bool {
        !self.txbuf.empty()
    }
}

impl mio::event::Source for TcpLink {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

/// In special cases where the default that gets picked when resolving an
/// address does not work, this allows to force either IPv4 or IPv6.
enum AddrFamilyRestrict {
    V4,
    V6,
    Either,
}

/// Resolve a socket address, appending the default port when missing.
fn find_addr(addr: &str, family: AddrFamilyRestrict) -> Result<SocketAddr, io::Error> {
    // Try to parse as-is, and if that fails try again with the default
    // port appended (both plain and bracketed-IPv6 forms).
    let iter = match addr.to_socket_addrs() {
        Ok(iter) => iter,
        Err(err) => {
            let addr_port = format!("{}:{}", addr, DEFAULT_PORT);
            match addr_port.to_socket_addrs() {
                Ok(iter) => iter,
                Err(_) => {
                    let addr_port = format!("[{}]:{}", addr, DEFAULT_PORT);
                    match addr_port.to_socket_addrs() {
                        Ok(iter) => iter,
                        _ => {
                            return Err(err);
                        }
                    }
                }
            }
        }
    };
    for sa in iter {
        match sa {
            SocketAddr::V4(_) => {
                if let AddrFamilyRestrict::V6 = family {
                    continue;
                }
            }
            SocketAddr::V6(_) => {
                if let AddrFamilyRestrict::V4 = family {
                    continue;
                }
            }
        }
        return Ok(sa);
    }
    Err(io::Error::new(
        io::ErrorKind::Other,
        "address resolution failed",
    ))
}

/// Resolves a port url (`tcp://address[:port]`, with `tcp4`/`tcp6` to force
/// an IP protocol version, or a bare `address[:port]`) to a socket address.
pub fn resolve_url(url: &str) -> io::Result<SocketAddr> {
    let split_url: Vec<&str> = url.splitn(2, "://").collect();
    match split_url[..] {
        ["tcp", addr] => find_addr(addr, AddrFamilyRestrict::Either),
        ["tcp4", addr] => find_addr(addr, AddrFamilyRestrict::V4),
        ["tcp6", addr] => find_addr(addr, AddrFamilyRestrict::V6),
        [addr] => find_addr(addr, AddrFamilyRestrict::Either),
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid url")),
    }
}

/// Opaque port object encapsulating I/O with the controller socket.
/// Dropping it closes the tx channel, which terminates the poller thread.
pub struct Port {
    tx: crossbeam::channel::Sender<String>,
    waker: mio::Waker,
}

/// Default size of the rx channel when receiving to a crossbeam channel.
static DEFAULT_RX_CHANNEL_SIZE: usize = 64;

impl Port {
    /// Method running the `Port` thread event loop. It bridges `mio` and
    /// `crossbeam::channel` and takes care of tx buffering/draining.
    fn poller_thread<RxCallbackT: Fn(Result<String, RecvError>) -> io::Result<()>>(
        mut link: TcpLink,
        mut poll: mio::Poll,
        rx: RxCallbackT,
        tx: crossbeam::channel::Receiver<String>,
    ) {
        use crossbeam::channel::TryRecvError;

        let mut events = mio::Events::with_capacity(1);
        let mut needs_draining = false;

        // Set when tx lines arrive while the socket is still draining.
        let mut needs_tx_queue_check = false;

        poll.registry()
            .register(&mut link, mio::Token(1), mio::Interest::READABLE)
            .expect("mio::Poll link registration failure");

        'ioloop: loop {
            poll.poll(&mut events, None).expect("Poll failed");

            let mut check_tx_channel = false;

            for event in events.iter() {
                match event.token() {
                    mio::Token(0) => {
                        // One or more lines were queued on the tx channel,
                        // or the tx channel was closed.
                        if needs_draining {
                            needs_tx_queue_check = true;
                        } else {
                            check_tx_channel = true;
                        }
                    }
                    mio::Token(1) => {
                        if event.is_writable() {
                            if needs_draining {
                                match link.drain() {
                                    Ok(_) => {
                                        needs_draining = false;
                                        poll.registry()
                                            .reregister(
                                                &mut link,
                                                mio::Token(1),
                                                mio::Interest::READABLE,
                                            )
                                            .expect("Readable interest set failed");
                                        // Lines may have queued up while the
                                        // socket was blocked.
                                        needs_tx_queue_check = true;
                                    }
                                    Err(SendError::MustDrain) => {
                                        // Must keep trying, do nothing
                                    }
                                    Err(_) => {
                                        break 'ioloop;
                                    }
                                }
                            }
                        }
                        // Lines or an error available from the socket
                        loop {
                            match link.recv() {
                                Ok(line) => {
                                    if rx(Ok(line)).is_err() {
                                        // RX callback signaled an error, terminate.
                                        break 'ioloop;
                                    }
                                }
                                Err(RecvError::NotReady) => {
                                    break;
                                }
                                Err(e) => {
                                    // Pass the error along and terminate. The
                                    // rx side decides what a disconnect means.
                                    let _ = rx(Err(e));
                                    break 'ioloop;
                                }
                            }
                        }
                    }
                    mio::Token(x) => {
                        panic!("Unexpected token {}", x);
                    }
                }
            }

            if !needs_draining && needs_tx_queue_check {
                check_tx_channel = true;
                needs_tx_queue_check = false;
            }

            if check_tx_channel {
                // Dequeue and write to the socket, or break out.
                loop {
                    match tx.try_recv() {
                        Ok(line) => match link.send(&line) {
                            Err(SendError::MustDrain) => {
                                needs_draining = true;
                                poll.registry()
                                    .reregister(
                                        &mut link,
                                        mio::Token(1),
                                        mio::Interest::READABLE.add(mio::Interest::WRITABLE),
                                    )
                                    .expect("Writable interest set failed");
                                break;
                            }
                            Err(SendError::Full) => {
                                // Cannot happen: a MustDrain send breaks out
                                // of this loop and the line gets drained
                                // before the channel is checked again.
                            }
                            Err(_) => {
                                break 'ioloop;
                            }
                            Ok(_) => {}
                        },
                        Err(TryRecvError::Empty) => {
                            break;
                        }
                        Err(TryRecvError::Disconnected) => {
                            break 'ioloop;
                        }
                    }
                }
            }
        }
    }

    /// Create a `Port` from a `TcpLink` and a rx callback.
    fn from_link<RxCallbackT: Fn(Result<String, RecvError>) -> io::Result<()> + Send + 'static>(
        link: TcpLink,
        rx: RxCallbackT,
    ) -> io::Result<Port> {
        let (tx, ttx) = crossbeam::channel::bounded::<String>(32);
        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), mio::Token(0))?;
        thread::spawn(move || {
            Port::poller_thread(link, poll, rx, ttx);
        });
        Ok(Port { tx, waker })
    }

    /// Create a new port from a `mio::net::TcpStream`.
    pub fn from_mio_stream<
        RXT: Fn(Result<String, RecvError>) -> io::Result<()> + Send + 'static,
    >(
        stream: mio::net::TcpStream,
        rx: RXT,
    ) -> io::Result<Port> {
        Port::from_link(TcpLink::from_stream(stream), rx)
    }

    /// Create a new port from a connected `std::net::TcpStream`.
    pub fn from_tcp_stream<
        RXT: Fn(Result<String, RecvError>) -> io::Result<()> + Send + 'static,
    >(
        stream: TcpStream,
        rx: RXT,
    ) -> io::Result<Port> {
        stream.set_nonblocking(true)?;
        Port::from_mio_stream(mio::net::TcpStream::from_std(stream), rx)
    }

    /// Connects to the service at `url` (see `resolve_url`) with the given
    /// connect timeout, sending received lines or errors to `rx`.
    pub fn connect<RXT: Fn(Result<String, RecvError>) -> io::Result<()> + Send + 'static>(
        url: &str,
        timeout: Duration,
        rx: RXT,
    ) -> io::Result<Port> {
        let addr = resolve_url(url)?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Port::from_tcp_stream(stream, rx)
    }

    /// Creates a sender/receiver pair to be used with `rx_to_channel`:
    /// ```ignore
    /// let (rx_send, port_rx) = Port::rx_channel();
    /// let port = Port::connect(url, timeout, Port::rx_to_channel(rx_send))?;
    /// ```
    /// In the example, `port.send()` can now be used to send and
    /// `port_rx.recv()` to receive.
    pub fn rx_channel() -> (
        crossbeam::channel::Sender<Result<String, RecvError>>,
        crossbeam::channel::Receiver<Result<String, RecvError>>,
    ) {
        crossbeam::channel::bounded::<Result<String, RecvError>>(DEFAULT_RX_CHANNEL_SIZE)
    }

    /// Returns a RX callback which sends the received results to a channel
    /// (see `rx_channel`). A full channel blocks the poller thread until
    /// the consumer catches up: the protocol's bulk phases are terminated
    /// by a single `.` line, so a dropped line would corrupt the mirror or
    /// wedge the phase. Stalling the reads lets TCP flow control push back
    /// on the controller instead.
    pub fn rx_to_channel(
        rx_send: crossbeam::channel::Sender<Result<String, RecvError>>,
    ) -> impl Fn(Result<String, RecvError>) -> io::Result<()> {
        move |rxdata| -> io::Result<()> {
            if let Err(RecvError::Disconnected) = rxdata {
                let _ = rx_send.send(rxdata);
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            match rx_send.send(rxdata) {
                Ok(_) => Ok(()),
                Err(_) => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
            }
        }
    }

    /// Sends a line to this port synchronously. This call will block if
    /// the port is backed up.
    pub fn send(&self, line: String) -> Result<(), SendError> {
        if self.tx.send(line).is_err() {
            Err(SendError::Disconnected)
        } else if self.waker.wake().is_err() {
            Err(SendError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Attempts to send a line to this port without blocking.
    pub fn try_send(&self, line: String) -> Result<(), SendError> {
        use crossbeam::channel::TrySendError;
        match self.tx.try_send(line) {
            Ok(()) => {
                if self.waker.wake().is_err() {
                    Err(SendError::Disconnected)
                } else {
                    Ok(())
                }
            }
            Err(TrySendError::Full(_)) => Err(SendError::Full),
            Err(_) => Err(SendError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    // A bulk snapshot can arrive as one burst far larger than the rx
    // channel. With a stalled consumer every line, including the
    // terminator, must still come through.
    #[test]
    fn slow_consumer_loses_no_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut block = String::new();
            for i in 0..200 {
                block.push_str(&format!("source led-red - tile.sig{} {}\n", i, i));
            }
            block.push_str(".\n");
            stream.write_all(block.as_bytes()).unwrap();
            stream
        });

        let (rx_send, rx) = Port::rx_channel();
        let stream = TcpStream::connect(addr).unwrap();
        let _port = Port::from_tcp_stream(stream, Port::rx_to_channel(rx_send)).unwrap();

        // Let the whole burst land while nobody is draining the channel.
        thread::sleep(Duration::from_millis(500));

        let mut lines = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                Ok(line) => {
                    let done = line == ".";
                    lines.push(line);
                    if done {
                        break;
                    }
                }
                Err(e) => panic!("recv error: {:?}", e),
            }
        }
        assert_eq!(lines.len(), 201);
        assert_eq!(lines[0], "source led-red - tile.sig0 0");
        assert_eq!(lines[199], "source led-red - tile.sig199 199");
        server.join().unwrap();
    }
}
