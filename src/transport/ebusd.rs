//! A client for the ebusd TCP command interface.
//!
//! Requests are sent as `hex <ZZ><PB><SB><NN><DATA>` lines. ebusd answers with one or more
//! lines terminated by an empty line: the first hex line is the reply, possibly prefixed with
//! its own length, and `ERR: ...` lines report failures.

use std::time::Duration;

use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_util::bytes::{Buf as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info, trace, warn};

use super::{Error, Transport};
use crate::b524::{self, EchoHeader, RegisterOpcode};

/// Longest line the daemon is expected to produce.
const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "ebusd::Args")]
pub struct Args {
    /// The host running ebusd.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// The ebusd command port.
    #[arg(long, default_value = "8888")]
    port: u16,

    /// Consider a request failed if ebusd has not answered within this amount of time.
    #[arg(long, default_value = "5s")]
    read_timeout: humantime::Duration,

    /// Give up connecting to ebusd after this amount of time.
    #[arg(long, default_value = "3s")]
    connect_timeout: humantime::Duration,

    /// How long to wait for the empty line that terminates a reply once its payload arrived.
    ///
    /// Some ebusd versions keep the reply open, so this should stay short.
    #[arg(long, default_value = "50ms")]
    terminator_grace: humantime::Duration,

    /// How long to let ebusd reacquire the bus after it reports `no signal`.
    ///
    /// The request is retried once afterwards if the daemon has the signal back.
    #[arg(long, default_value = "10s")]
    no_signal_wait: humantime::Duration,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    pub terminator_grace: Duration,
    pub no_signal_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8888,
            read_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
            terminator_grace: Duration::from_millis(50),
            no_signal_wait: Duration::from_secs(10),
        }
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            read_timeout: *args.read_timeout,
            connect_timeout: *args.connect_timeout,
            terminator_grace: *args.terminator_grace,
            no_signal_wait: *args.no_signal_wait,
        }
    }
}

/// One line of ebusd output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Line {
    Blank,
    Hex(Vec<u8>),
    Error(String),
    Other(String),
}

impl Line {
    pub fn classify(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Self::Blank;
        }
        if let Some(message) = text.strip_prefix("ERR:") {
            return Self::Error(message.trim().to_string());
        }
        if text.bytes().all(|b| b.is_ascii_hexdigit()) {
            if let Ok(bytes) = b524::decode_hex(text) {
                return Self::Hex(bytes);
            }
        }
        Self::Other(text.to_string())
    }
}

/// Map an `ERR:` message onto the transport error taxonomy.
pub fn classify_error(message: &str) -> Error {
    let lowered = message.to_ascii_lowercase();
    const TRANSIENT: [&str; 5] =
        ["timeout", "timed out", "no answer", "syn received", "wrong symbol"];
    if TRANSIENT.iter().any(|t| lowered.contains(t)) {
        Error::Timeout
    } else if lowered.contains("not enabled") {
        Error::CommandNotEnabled(message.to_string())
    } else {
        Error::Rejected(message.to_string())
    }
}

/// ebusd prefixes some replies with their own length byte.
pub fn strip_length_prefix(mut bytes: Vec<u8>) -> Vec<u8> {
    if let Some(&length) = bytes.first() {
        if usize::from(length) == bytes.len() - 1 {
            bytes.remove(0);
        }
    }
    bytes
}

pub fn format_command(
    destination: u8,
    primary: u8,
    secondary: u8,
    payload: &[u8],
) -> Option<String> {
    let length = u8::try_from(payload.len()).ok()?;
    let mut command = format!("hex {destination:02X}{primary:02X}{secondary:02X}{length:02X}");
    command.push_str(&b524::encode_hex(payload).to_ascii_uppercase());
    Some(command)
}

pub struct LineCodec {}

impl Encoder<&str> for LineCodec {
    type Error = std::io::Error;
    fn encode(&mut self, line: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\n");
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for LineCodec {
    type Item = Line;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(end) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > MAX_LINE_LENGTH {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "ebusd line exceeds the maximum length",
                ));
            }
            return Ok(None);
        };
        let line = Line::classify(&String::from_utf8_lossy(&src[..end]));
        src.advance(end + 1);
        trace!(message = "decoded a line", ?line);
        Ok(Some(line))
    }
}

type EbusdIo = Framed<TcpStream, LineCodec>;

pub struct EbusdTransport {
    config: Config,
    io: Option<EbusdIo>,
}

impl EbusdTransport {
    /// The connection is established lazily, on the first request.
    pub fn new(config: Config) -> Self {
        Self { config, io: None }
    }

    async fn connect(&mut self) -> Result<EbusdIo, Error> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        info!(message = "connecting...", %address);
        let addresses = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| Error::LookupHost(e, address.clone()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        let connect = TcpStream::connect(&*addresses);
        let socket = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(socket) => socket.map_err(|e| Error::Connect(e, address.clone()))?,
            Err(_) => {
                let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out");
                return Err(Error::Connect(e, address));
            }
        };
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected");
        Ok(Framed::new(socket, LineCodec {}))
    }

    /// Discard lines left over from earlier exchanges, e.g. late terminators or error lines.
    fn drain_stale(io: &mut EbusdIo) -> bool {
        loop {
            match io.next().now_or_never() {
                None => return true,
                Some(Some(Ok(line))) => debug!(message = "discarding stale line", ?line),
                Some(Some(Err(e))) => {
                    warn!(message = "connection broken", error = (&e as &dyn std::error::Error));
                    return false;
                }
                Some(None) => {
                    debug!(message = "connection closed by the daemon");
                    return false;
                }
            }
        }
    }

    /// Consume lines up to the empty terminator line. Anything but the terminator is ignored.
    async fn await_terminator(io: &mut EbusdIo, grace: Duration) {
        let terminator = async {
            while let Some(Ok(line)) = io.next().await {
                if line == Line::Blank {
                    break;
                }
                trace!(message = "ignoring trailing line", ?line);
            }
        };
        if tokio::time::timeout(grace, terminator).await.is_err() {
            trace!("no terminator within the grace period");
        }
    }

    async fn read_reply(io: &mut EbusdIo, grace: Duration) -> Result<Vec<u8>, ReadError> {
        loop {
            let line = match io.next().await {
                None => return Err(ReadError::Closed),
                Some(Err(e)) => return Err(ReadError::Io(e)),
                Some(Ok(line)) => line,
            };
            match line {
                Line::Hex(bytes) => {
                    Self::await_terminator(io, grace).await;
                    return Ok(strip_length_prefix(bytes));
                }
                Line::Error(message) => {
                    Self::await_terminator(io, grace).await;
                    return Err(ReadError::Daemon(classify_error(&message)));
                }
                Line::Blank => return Ok(Vec::new()),
                Line::Other(text) => debug!(message = "ignoring unexpected line", %text),
            }
        }
    }

    async fn io(&mut self) -> Result<EbusdIo, Error> {
        match self.io.take() {
            Some(mut io) => {
                if Self::drain_stale(&mut io) {
                    Ok(io)
                } else {
                    self.connect().await
                }
            }
            None => self.connect().await,
        }
    }

    /// Send one command line and wait for its reply.
    async fn exchange(&mut self, command: &str) -> Result<Vec<u8>, Error> {
        let mut io = self.io().await?;
        debug!(message = "sending", %command);
        let grace = self.config.terminator_grace;
        let exchange = async {
            io.send(command).await.map_err(ReadError::Io)?;
            Self::read_reply(&mut io, grace).await
        };
        let result = tokio::time::timeout(self.config.read_timeout, exchange).await;
        match result {
            Ok(Ok(reply)) => {
                trace!(message = "received", reply = ?reply);
                self.io = Some(io);
                Ok(reply)
            }
            Ok(Err(ReadError::Daemon(error))) => {
                debug!(message = "daemon reported an error", %error);
                self.io = Some(io);
                Err(error)
            }
            // The reply is lost either way; a fresh connection is made for the next request.
            Ok(Err(ReadError::Closed)) => {
                warn!("connection closed by the daemon mid-request, will reconnect");
                Err(Error::Timeout)
            }
            Ok(Err(ReadError::Io(e))) => {
                warn!(
                    message = "request failed, will reconnect",
                    error = (&e as &dyn std::error::Error)
                );
                Err(Error::Timeout)
            }
            Err(_) => {
                debug!("request timed out, will reconnect");
                Err(Error::Timeout)
            }
        }
    }

    /// Ask the daemon for its status and report whether it still lacks the bus signal.
    async fn signal_restored(&mut self) -> Result<bool, Error> {
        let mut io = self.io().await?;
        let status = async {
            io.send("info").await.map_err(ReadError::Io)?;
            let mut restored = true;
            loop {
                match io.next().await {
                    None => return Err(ReadError::Closed),
                    Some(Err(e)) => return Err(ReadError::Io(e)),
                    Some(Ok(Line::Blank)) => return Ok(restored),
                    Some(Ok(Line::Error(message))) => {
                        restored &= !is_no_signal(&classify_error(&message));
                    }
                    Some(Ok(line)) => trace!(message = "info", ?line),
                }
            }
        };
        match tokio::time::timeout(self.config.read_timeout, status).await {
            Ok(Ok(restored)) => {
                self.io = Some(io);
                Ok(restored)
            }
            Ok(Err(_)) | Err(_) => {
                debug!("no usable reply to the info command, will reconnect");
                Ok(false)
            }
        }
    }
}

fn is_no_signal(error: &Error) -> bool {
    matches!(error, Error::Rejected(message) if message.to_ascii_lowercase().contains("no signal"))
}

enum ReadError {
    Closed,
    Io(std::io::Error),
    Daemon(Error),
}

impl Transport for EbusdTransport {
    async fn send_proto(
        &mut self,
        destination: u8,
        primary: u8,
        secondary: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let command = format_command(destination, primary, secondary, payload)
            .ok_or_else(|| Error::Protocol(format!("payload of {} bytes", payload.len())))?;
        match self.exchange(&command).await {
            Err(error) if is_no_signal(&error) => {
                warn!(
                    message = "ebusd lost the bus signal, waiting before retrying",
                    wait = ?self.config.no_signal_wait,
                );
                tokio::time::sleep(self.config.no_signal_wait).await;
                if !self.signal_restored().await? {
                    return Err(error);
                }
                info!("bus signal is back, retrying the request");
                self.exchange(&command).await
            }
            result => result,
        }
    }

    fn echo_header(&self, _: RegisterOpcode) -> EchoHeader {
        EchoHeader::Status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

    #[test]
    fn command_line() {
        let payload = b524::register_read(RegisterOpcode::Local, 0x02, 0x00, 0x000F);
        assert_eq!(
            format_command(0x15, 0xB5, 0x24, &payload).unwrap(),
            "hex 15B52406020002000F00"
        );
        assert_eq!(format_command(0x15, 0x07, 0x04, &[]).unwrap(), "hex 15070400");
        assert_eq!(format_command(0x15, 0xB5, 0x24, &[0; 300]), None);
    }

    #[test]
    fn length_prefix() {
        assert_eq!(
            strip_length_prefix(vec![0x04, 0x00, 0x00, 0x80, 0x3F]),
            [0x00, 0x00, 0x80, 0x3F]
        );
        assert_eq!(strip_length_prefix(vec![0x01, 0x00]), [0x00]);
        assert_eq!(strip_length_prefix(vec![0x01, 0x02, 0x03]), [0x01, 0x02, 0x03]);
        assert_eq!(strip_length_prefix(vec![]), Vec::<u8>::new());
    }

    #[test]
    fn line_classification() {
        assert_eq!(Line::classify(""), Line::Blank);
        assert_eq!(Line::classify("0100\r"), Line::Hex(vec![0x01, 0x00]));
        assert_eq!(Line::classify("ERR: timeout"), Line::Error("timeout".into()));
        assert_eq!(Line::classify("abc"), Line::Other("abc".into()));
        assert!(matches!(classify_error("timed out"), Error::Timeout));
        assert!(matches!(classify_error("no answer"), Error::Timeout));
        assert!(matches!(classify_error("SYN received"), Error::Timeout));
        assert!(matches!(classify_error("wrong symbol received"), Error::Timeout));
        assert!(matches!(classify_error("no signal"), Error::Rejected(_)));
        assert!(matches!(classify_error("command not enabled"), Error::CommandNotEnabled(_)));
    }

    #[tokio::test]
    async fn exchange_with_fake_daemon() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let daemon = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                let reply: &[u8] = match received.len() {
                    0 => b"0601020f003412\nERR: late noise\n\n",
                    1 => b"ERR: timeout\n\n",
                    _ => b"ERR: invalid argument\n\n",
                };
                received.push(line);
                write.write_all(reply).await.unwrap();
            }
            received
        });

        let config = Config { port, ..Config::default() };
        let mut transport = EbusdTransport::new(config);
        let payload = b524::register_read(RegisterOpcode::Local, 0x02, 0x00, 0x000F);
        let reply = transport.send(0x15, &payload).await.unwrap();
        assert_eq!(reply, [0x01, 0x02, 0x0F, 0x00, 0x34, 0x12]);
        assert!(matches!(transport.send(0x15, &payload).await, Err(Error::Timeout)));
        assert!(matches!(transport.send(0x15, &payload).await, Err(Error::Rejected(_))));
        drop(transport);
        let received = daemon.await.unwrap();
        assert_eq!(received, vec!["hex 15B52406020002000F00"; 3]);
    }

    /// A daemon answering each received line with the next canned reply.
    async fn scripted_daemon(
        replies: &'static [&'static str],
    ) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let daemon = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                let reply = replies.get(received.len()).copied().unwrap_or("ERR: unexpected\n\n");
                received.push(line);
                write.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });
        (port, daemon)
    }

    #[tokio::test]
    async fn no_signal_is_retried_once_the_signal_is_back() {
        let (port, daemon) = scripted_daemon(&[
            "ERR: no signal\n\n",
            "version: ebusd 23.2\nsignal: acquired\n\n",
            "010203\n\n",
        ])
        .await;
        let config = Config { port, no_signal_wait: Duration::ZERO, ..Config::default() };
        let mut transport = EbusdTransport::new(config);
        let payload = b524::register_read(RegisterOpcode::Local, 0x02, 0x00, 0x000F);
        assert_eq!(transport.send(0x15, &payload).await.unwrap(), [0x01, 0x02, 0x03]);
        drop(transport);
        assert_eq!(
            daemon.await.unwrap(),
            ["hex 15B52406020002000F00", "info", "hex 15B52406020002000F00"]
        );
    }

    #[tokio::test]
    async fn no_signal_persisting_is_reported() {
        let (port, daemon) =
            scripted_daemon(&["ERR: no signal\n\n", "ERR: no signal\n\n"]).await;
        let config = Config { port, no_signal_wait: Duration::ZERO, ..Config::default() };
        let mut transport = EbusdTransport::new(config);
        let payload = b524::register_read(RegisterOpcode::Local, 0x02, 0x00, 0x000F);
        let result = transport.send(0x15, &payload).await;
        assert!(matches!(result, Err(Error::Rejected(message)) if message == "no signal"));
        drop(transport);
        assert_eq!(daemon.await.unwrap(), ["hex 15B52406020002000F00", "info"]);
    }
}
