//! Console and debugger TCP endpoints.
//!
//! Grounded on `original_source/mon.c`'s socket handling: a single
//! non-blocking listener, one client at a time, a banner on connect. The
//! debugger's embedded TCL-like command interpreter is explicitly out of
//! scope; [`LineDebugger`] recognizes only the four one-word
//! commands `original_source/mon.c`'s `PICOL_COMMAND`s implement that the
//! execution loop actually observes: `quit`, `cont`, `pause`, `ss`.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};

use log::info;

use crate::error::{Error, Result};

/// A single-client, non-blocking TCP byte stream with a connect banner.
pub struct TcpEndpoint {
    listener: TcpListener,
    client: Option<TcpStream>,
    banner: &'static str,
    name: &'static str,
}

impl TcpEndpoint {
    pub fn bind(port: u16, name: &'static str, banner: &'static str) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        info!(target: "pvp::net", "{name} listening on 127.0.0.1:{port}");
        Ok(Self {
            listener,
            client: None,
            banner,
            name,
        })
    }

    /// Accept a pending connection if there is one and no client is
    /// currently attached. Sends the banner on acceptance.
    pub fn poll_accept(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        match self.listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(true)?;
                info!(target: "pvp::net", "{} connected from {addr}", self.name);
                let mut stream = stream;
                let _ = stream.write_all(self.banner.as_bytes());
                self.client = Some(stream);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(Error::Posix(e)),
        }
    }

    /// Non-blocking read. `Ok(0)` means no data is currently available or
    /// there is no client, matching `original_source`'s `socket_in`
    /// returning 0 on `EWOULDBLOCK`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<u32> {
        let Some(stream) = self.client.as_mut() else {
            return Ok(0);
        };
        match stream.read(buf) {
            Ok(0) => {
                self.disconnect();
                Ok(0)
            }
            Ok(n) => Ok(n as u32),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::Posix(e)),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<u32> {
        let Some(stream) = self.client.as_mut() else {
            return Ok(0);
        };
        match stream.write(buf) {
            Ok(n) => Ok(n as u32),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::Posix(e)),
        }
    }

    fn disconnect(&mut self) {
        if self.client.take().is_some() {
            info!(target: "pvp::net", "{} disconnected", self.name);
        }
    }
}

/// What the debugger connection wants the execution loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerAction {
    None,
    Continue,
    Pause,
    Shutdown,
    SingleStepToggled,
}

/// The debugger connection's command surface. Implementations decide how
/// raw bytes become an action; the built-in [`LineDebugger`] is the
/// minimal one-word-command reader this monitor needs.
pub trait Debugger {
    fn poll(&mut self) -> Result<DebuggerAction>;
}

/// Reads newline-terminated one-word commands off a [`TcpEndpoint`] and
/// maps exactly the four words the execution loop cares about.
pub struct LineDebugger {
    endpoint: TcpEndpoint,
    line: String,
}

impl LineDebugger {
    pub fn new(port: u16) -> Result<Self> {
        let banner = "This is the PVP monitor console\r\n-------------------------------\r\n\n";
        Ok(Self {
            endpoint: TcpEndpoint::bind(port, "debugger", banner)?,
            line: String::new(),
        })
    }
}

impl Debugger for LineDebugger {
    fn poll(&mut self) -> Result<DebuggerAction> {
        self.endpoint.poll_accept()?;
        let mut byte = [0u8; 1];
        let n = self.endpoint.read(&mut byte)?;
        if n == 0 {
            return Ok(DebuggerAction::None);
        }
        match byte[0] {
            b'\r' => Ok(DebuggerAction::None),
            b'\n' => {
                let cmd = std::mem::take(&mut self.line);
                Ok(match cmd.trim() {
                    "quit" => DebuggerAction::Shutdown,
                    "cont" => DebuggerAction::Continue,
                    "pause" => DebuggerAction::Pause,
                    "ss" => DebuggerAction::SingleStepToggled,
                    _ => DebuggerAction::None,
                })
            }
            b => {
                self.line.push(b as char);
                Ok(DebuggerAction::None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdStream;

    #[test]
    fn endpoint_delivers_banner_and_echoes_writes() {
        let mut ep = TcpEndpoint::bind(0, "test", "hi\n").unwrap();
        let addr = ep.listener.local_addr().unwrap();
        let mut client = StdStream::connect(addr).unwrap();
        // Give the OS a moment to complete the handshake before polling.
        std::thread::sleep(std::time::Duration::from_millis(20));
        ep.poll_accept().unwrap();
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi\n");
    }
}
