//! Byte-stream endpoints a device can be reached through. A [Transport] only
//! moves bytes; framing lives in [crate::protocol].

use log::{debug, info, warn};
use serial2::SerialPort;

use std::{
    borrow::Cow,
    fmt,
    io::{self, Write},
    net::TcpStream,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

/// How long a TCP write may block before it counts as failed.
const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Where a device lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A serial device, by system path.
    Serial(PathBuf),
    /// A raw TCP socket, as `host:port`.
    Tcp(String),
    /// Swallows every byte. Used for simulated sessions.
    Null,
}

impl FromStr for Endpoint {
    type Err = std::convert::Infallible;

    /// `null`, `tcp://host:port`, or anything else as a serial path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.eq_ignore_ascii_case("null") {
            Endpoint::Null
        } else if let Some(addr) = s.strip_prefix("tcp://") {
            Endpoint::Tcp(addr.to_owned())
        } else {
            Endpoint::Serial(PathBuf::from(s))
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Endpoint::Serial(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Null => write!(f, "null"),
        }
    }
}

/// Every way talking to a device can fail. All of them are recoverable: the
/// operator can pick another endpoint and carry on.
#[derive(Debug)]
pub enum TransportError {
    /// Nothing is connected, or the connection was dropped after an error.
    NotConnected,

    /// The endpoint could not be opened.
    Open {
        /// The endpoint that was tried.
        endpoint: Endpoint,
        /// Why it failed.
        source: io::Error,
    },

    /// A write did not go through.
    Write(io::Error),

    /// The device worker did not answer in time.
    Timeout,

    /// The device worker thread is gone.
    WorkerGone,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use TransportError as TE;
        let msg = match self {
            TE::NotConnected => Cow::from("device is not connected"),
            TE::Open { endpoint, source } => {
                Cow::from(format!("could not open {endpoint}: {source}"))
            }
            TE::Write(error) => Cow::from(format!("write to device failed: {error}")),
            TE::Timeout => Cow::from("device did not respond in time"),
            TE::WorkerGone => Cow::from("device worker has stopped"),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Open { source, .. } => Some(source),
            TransportError::Write(error) => Some(error),
            _ => None,
        }
    }
}

/// A byte sink connected to one device.
pub trait Transport: Send {
    /// Where the bytes go.
    fn endpoint(&self) -> Endpoint;

    /// Whether the underlying connection is currently open.
    fn is_open(&self) -> bool;

    /// Opens the connection if it is not open yet.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Writes a whole frame, opening the connection first if needed.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Drops the connection. Further writes reopen it.
    fn close(&mut self);
}

/// A device on a serial line, opened lazily on the first write.
pub struct SerialTransport {
    path: PathBuf,
    baud_rate: u32,
    port: Option<SerialPort>,
}

impl SerialTransport {
    /// Does not touch the port until the first write.
    pub fn new(path: impl Into<PathBuf>, baud_rate: u32) -> Self {
        SerialTransport {
            path: path.into(),
            baud_rate,
            port: None,
        }
    }
}

impl Transport for SerialTransport {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Serial(self.path.clone())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_none() {
            let port = SerialPort::open(&self.path, self.baud_rate).map_err(|source| {
                TransportError::Open {
                    endpoint: self.endpoint(),
                    source,
                }
            })?;
            info!("opened {} at {} baud", self.path.display(), self.baud_rate);
            self.port = Some(port);
        }
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.open()?;
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        if let Err(error) = port.write_all(bytes) {
            warn!("{} : write failed, dropping port", self.path.display());
            self.port = None;
            return Err(TransportError::Write(error));
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("closed {}", self.path.display());
        }
    }
}

/// A device behind a raw TCP socket, connected lazily on the first write.
#[derive(Debug)]
pub struct TcpTransport {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Does not connect until the first write.
    pub fn new(addr: impl Into<String>) -> Self {
        TcpTransport {
            addr: addr.into(),
            stream: None,
        }
    }
}

impl Transport for TcpTransport {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Tcp(self.addr.clone())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.stream.is_none() {
            let open_error = |source| TransportError::Open {
                endpoint: Endpoint::Tcp(self.addr.clone()),
                source,
            };
            let stream = TcpStream::connect(&self.addr).map_err(open_error)?;
            stream.set_nodelay(true).map_err(open_error)?;
            stream
                .set_write_timeout(Some(TCP_WRITE_TIMEOUT))
                .map_err(open_error)?;
            info!("connected to {}", self.addr);
            self.stream = Some(stream);
        }
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.open()?;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        if let Err(error) = stream.write_all(bytes) {
            warn!("tcp://{} : write failed, dropping connection", self.addr);
            self.stream = None;
            return Err(TransportError::Write(error));
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("disconnected from {}", self.addr);
        }
    }
}

/// Accepts and discards everything.
#[derive(Debug, Default)]
pub struct NullTransport {
    open: bool,
}

impl Transport for NullTransport {
    fn endpoint(&self) -> Endpoint {
        Endpoint::Null
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        Ok(())
    }

    fn write_all(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Builds the [Transport] for `endpoint`. Nothing is opened yet.
pub fn connect(endpoint: &Endpoint, baud_rate: u32) -> Box<dyn Transport> {
    match endpoint {
        Endpoint::Serial(path) => Box::new(SerialTransport::new(path.clone(), baud_rate)),
        Endpoint::Tcp(addr) => Box::new(TcpTransport::new(addr.clone())),
        Endpoint::Null => Box::new(NullTransport::default()),
    }
}

/// Serial ports the operating system knows about.
pub fn available_ports() -> Result<Vec<PathBuf>, io::Error> {
    SerialPort::available_ports()
}

/// An in-memory [Transport] that records what was written and can be told to
/// fail, for tests and dry runs.
pub mod mock {
    use super::{Endpoint, Transport, TransportError};
    use crate::protocol::{decode_frames, Command, Opcode};

    use std::{
        io,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        thread,
        time::Duration,
    };

    #[derive(Debug, Default)]
    struct MockState {
        open: bool,
        written: Vec<u8>,
        writes: usize,
        fail_open: usize,
        fail_opcode: Option<(u8, usize)>,
        stall: Option<Duration>,
    }

    /// Cloning gives another handle on the same recorded state, so a test can
    /// keep one handle while the device owns the other.
    #[derive(Debug, Clone, Default)]
    pub struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        /// A healthy, closed mock.
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Every byte successfully written so far.
        pub fn written(&self) -> Vec<u8> {
            self.state().written.clone()
        }

        /// The successfully written bytes, read back as commands.
        pub fn commands(&self) -> Vec<Command> {
            decode_frames(&self.written()).unwrap_or_default()
        }

        /// Number of successful writes.
        pub fn write_count(&self) -> usize {
            self.state().writes
        }

        /// Forget everything written so far.
        pub fn clear(&self) {
            let mut state = self.state();
            state.written.clear();
            state.writes = 0;
        }

        /// The next `times` writes of a frame with `opcode` fail.
        pub fn fail_opcode(&self, opcode: Opcode, times: usize) {
            self.state().fail_opcode = Some((opcode as u8, times));
        }

        /// The next `times` attempts to open fail.
        pub fn fail_open(&self, times: usize) {
            self.state().fail_open = times;
        }

        /// Every write blocks for `delay` before completing.
        pub fn stall_for(&self, delay: Option<Duration>) {
            self.state().stall = delay;
        }
    }

    impl Transport for MockTransport {
        fn endpoint(&self) -> Endpoint {
            Endpoint::Tcp("mock".to_owned())
        }

        fn is_open(&self) -> bool {
            self.state().open
        }

        fn open(&mut self) -> Result<(), TransportError> {
            let mut state = self.state();
            if !state.open {
                if state.fail_open > 0 {
                    state.fail_open -= 1;
                    return Err(TransportError::Open {
                        endpoint: Endpoint::Tcp("mock".to_owned()),
                        source: io::Error::new(io::ErrorKind::NotFound, "mock refused to open"),
                    });
                }
                state.open = true;
            }
            Ok(())
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.open()?;

            let stall = self.state().stall;
            if let Some(delay) = stall {
                thread::sleep(delay);
            }

            let mut state = self.state();
            if let Some((opcode, remaining)) = state.fail_opcode {
                if remaining > 0 && bytes.get(1) == Some(&opcode) {
                    state.fail_opcode = Some((opcode, remaining - 1));
                    state.open = false;
                    return Err(TransportError::Write(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "mock write failure",
                    )));
                }
            }
            state.written.extend_from_slice(bytes);
            state.writes += 1;
            Ok(())
        }

        fn close(&mut self) {
            self.state().open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use crate::protocol::{Command, Opcode};

    use std::{io::Read, net::TcpListener, thread};

    #[test]
    fn endpoints_parse_and_print() {
        assert_eq!("null".parse::<Endpoint>(), Ok(Endpoint::Null));
        assert_eq!(
            "tcp://127.0.0.1:9000".parse::<Endpoint>(),
            Ok(Endpoint::Tcp("127.0.0.1:9000".to_owned()))
        );
        assert_eq!(
            "/dev/ttyUSB0".parse::<Endpoint>(),
            Ok(Endpoint::Serial(PathBuf::from("/dev/ttyUSB0")))
        );
        assert_eq!(
            Endpoint::Tcp("localhost:1".to_owned()).to_string(),
            "tcp://localhost:1"
        );
    }

    #[test]
    fn serial_transport_opens_lazily_and_reports_failure() {
        let mut transport = SerialTransport::new("/definitely/not/a/port", 115200);
        assert!(!transport.is_open());

        let err = transport.write_all(&[0x00, 0x0C]).unwrap_err();
        assert!(matches!(err, TransportError::Open { .. }));
        assert!(!transport.is_open());
    }

    #[test]
    fn tcp_transport_delivers_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let reader = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).unwrap();
            buf
        });

        let mut transport = connect(&Endpoint::Tcp(addr), 115200);
        transport.write_all(&Command::Ping.encode()).unwrap();
        transport.write_all(&Command::Stop.encode()).unwrap();
        assert!(transport.is_open());
        transport.close();

        assert_eq!(reader.join().unwrap(), vec![0x00, 0x0C, 0x00, 0x07]);
    }

    #[test]
    fn null_transport_swallows_everything() {
        let mut transport = connect(&Endpoint::Null, 9600);
        transport.write_all(&[1, 2, 3]).unwrap();
        assert!(transport.is_open());
        assert_eq!(transport.endpoint(), Endpoint::Null);
    }

    #[test]
    fn mock_failure_injection() {
        let mock = MockTransport::new();
        let mut transport: Box<dyn Transport> = Box::new(mock.clone());

        mock.fail_open(1);
        assert!(matches!(
            transport.write_all(&Command::Ping.encode()),
            Err(TransportError::Open { .. })
        ));
        transport.write_all(&Command::Ping.encode()).unwrap();

        mock.fail_opcode(Opcode::Stop, 1);
        assert!(matches!(
            transport.write_all(&Command::Stop.encode()),
            Err(TransportError::Write(_))
        ));
        assert!(!mock.is_open());
        transport.write_all(&Command::Stop.encode()).unwrap();

        assert_eq!(mock.write_count(), 2);
        assert_eq!(mock.commands(), vec![Command::Ping, Command::Stop]);
    }
}
