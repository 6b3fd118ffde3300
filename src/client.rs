//! Line session to a MAX! Cube LAN gateway.
//!
//! - Blocking `std::net::TcpStream` (no async); the owner serializes access.
//! - Every line read is handed to a callback before the terminator check, so decoding and
//!   backup mirroring see the hub's output exactly as it arrives.
//!
//! Connection policy
//! - A fresh connection starts with the hub's greeting (hello, room map, configurations and a
//!   device list), which is drained before the first command is written.
//! - Non-exclusive mode closes the socket after every exchange.
//! - `max_requests_per_connection` forces a reconnect after that many exchanges.
//! - Any error closes the socket; the next call reconnects. Nothing is retried here.

use crate::protocol::command::CubeCommand;
use log::{debug, trace};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 62910;
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum CubeClientError {
    Resolve(String),
    Connect { target: String, source: io::Error },
    Io(io::Error),
    /// The hub closed the connection before the expected response.
    Closed,
}

impl core::fmt::Display for CubeClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CubeClientError::Resolve(s) => write!(f, "host lookup failed: {}", s),
            CubeClientError::Connect { target, source } => write!(f, "connect to {} failed: {}", target, source),
            CubeClientError::Io(e) => write!(f, "io error: {}", e),
            CubeClientError::Closed => write!(f, "connection closed by hub"),
        }
    }
}

impl std::error::Error for CubeClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CubeClientError::Connect { source, .. } => Some(source),
            CubeClientError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CubeClientError {
    fn from(value: io::Error) -> Self {
        CubeClientError::Io(value)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    /// Keep the socket open between exchanges.
    pub exclusive: bool,
    /// Zero disables the limit.
    pub max_requests_per_connection: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl SessionSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        SessionSettings {
            host: host.into(),
            port,
            exclusive: false,
            max_requests_per_connection: 0,
            connect_timeout: NETWORK_TIMEOUT,
            read_timeout: NETWORK_TIMEOUT,
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

pub struct CubeClient {
    settings: SessionSettings,
    conn: Option<Connection>,
    request_count: u32,
}

impl CubeClient {
    pub fn new(settings: SessionSettings) -> Self {
        CubeClient {
            settings,
            conn: None,
            request_count: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    /// Sends `command` and reads its response, passing every raw line to `on_line`.
    pub fn send(&mut self, command: &CubeCommand, on_line: &mut dyn FnMut(&str)) -> Result<(), CubeClientError> {
        let result = self.exchange(command, on_line);
        if let Err(e) = &result {
            debug!("Exchange '{}' with {} failed: {}", command.kind(), self.settings.target(), e);
        }
        if result.is_err() || !self.settings.exclusive {
            self.close();
        }
        result
    }

    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.writer.shutdown(std::net::Shutdown::Both);
            debug!("Closed connection to {}", self.settings.target());
        }
    }

    fn exchange(&mut self, command: &CubeCommand, on_line: &mut dyn FnMut(&str)) -> Result<(), CubeClientError> {
        let limit = self.settings.max_requests_per_connection;
        if self.conn.is_none() {
            self.connect()?;
        } else if limit > 0 && self.request_count >= limit {
            debug!("Reached {} requests on this connection, reconnecting", limit);
            self.close();
            self.connect()?;
        }

        if self.request_count == 0 {
            debug!("Reading greeting from {}", self.settings.target());
            self.read_lines("L:", 1, None, on_line)?;
        }

        // the greeting already carried a device list
        if !(self.request_count == 0 && *command == CubeCommand::ListDevices) {
            let text = command.command_string();
            debug!("Sending request #{} ({}) to {}", self.request_count, command.kind(), self.settings.target());
            trace!("Write to {}: {}", self.settings.target(), text.trim_end());
            let conn = self.conn.as_mut().ok_or(CubeClientError::Closed)?;
            conn.writer.write_all(text.as_bytes())?;
            conn.writer.flush()?;

            match command.terminator() {
                Some(terminator) => {
                    self.read_lines(terminator, command.expected_responses(), command.read_timeout(), on_line)?
                }
                None => self.close(),
            }
        }

        self.request_count += 1;
        Ok(())
    }

    fn connect(&mut self) -> Result<(), CubeClientError> {
        let target = self.settings.target();
        let addrs: Vec<SocketAddr> = (self.settings.host.as_str(), self.settings.port)
            .to_socket_addrs()
            .map_err(|e| CubeClientError::Resolve(format!("{}: {}", target, e)))?
            .collect();

        let mut last_err = None;
        let mut stream = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.settings.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match (stream, last_err) {
            (Some(s), _) => s,
            (None, Some(source)) => return Err(CubeClientError::Connect { target, source }),
            (None, None) => return Err(CubeClientError::Resolve(format!("{}: no addresses", target))),
        };

        stream.set_read_timeout(Some(self.settings.read_timeout))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        debug!("Opened connection to {}", target);
        self.conn = Some(Connection {
            reader: BufReader::new(stream),
            writer,
        });
        self.request_count = 0;
        Ok(())
    }

    /// Reads until `count` lines starting with `terminator` have been seen.
    fn read_lines(
        &mut self,
        terminator: &str,
        count: usize,
        timeout: Option<Duration>,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), CubeClientError> {
        let default_timeout = self.settings.read_timeout;
        let conn = self.conn.as_mut().ok_or(CubeClientError::Closed)?;
        if let Some(t) = timeout {
            conn.reader.get_ref().set_read_timeout(Some(t))?;
        }

        let mut seen = 0usize;
        let mut line = String::new();
        let result = loop {
            line.clear();
            match conn.reader.read_line(&mut line) {
                Ok(0) => break Err(CubeClientError::Closed),
                Ok(_) => {}
                Err(e) => break Err(CubeClientError::Io(e)),
            }
            let raw = line.trim_end_matches(['\r', '\n']);
            on_line(raw);
            if raw.starts_with(terminator) {
                seen += 1;
                if seen >= count {
                    break Ok(());
                }
            }
        };

        if timeout.is_some() {
            conn.reader.get_ref().set_read_timeout(Some(default_timeout))?;
        }
        result
    }
}
