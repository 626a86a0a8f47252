//! Socket addresses for client/collector connections.
//!
//! `unix:/path/to.sock` (or any absolute path) selects a Unix-domain socket,
//! `tcp:host:port` (or a bare `host:port`) a TCP socket.

use crate::protocol::transport::{open_channel, ChannelMode, MessageChannel, TransportError};
use std::fmt;
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                anyhow::bail!("Invalid endpoint: empty socket path");
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            return Ok(Endpoint::Tcp(addr.to_string()));
        }
        if s.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        if s.contains(':') {
            return Ok(Endpoint::Tcp(s.to_string()));
        }
        anyhow::bail!("Invalid endpoint: {}", s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

fn io_err(op: &'static str) -> impl FnOnce(std::io::Error) -> TransportError {
    move |source| TransportError::Io { op, source }
}

impl Endpoint {
    /// Connect and wrap the socket in a channel.
    pub fn connect(
        &self,
        mode: ChannelMode,
        max_frame: usize,
    ) -> Result<Box<dyn MessageChannel>, TransportError> {
        debug!("connecting to {}", self);
        match self {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).map_err(io_err("connect"))?;
                open_channel(stream, mode, max_frame)
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).map_err(io_err("connect"))?;
                stream.set_nodelay(true).map_err(io_err("set nodelay"))?;
                open_channel(stream, mode, max_frame)
            }
        }
    }

    /// Bind a listener. A stale Unix socket file is removed first.
    pub fn bind(&self) -> Result<EndpointListener, TransportError> {
        let listener = match self {
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path).map_err(io_err("remove stale socket"))?;
                }
                EndpointListener::Unix(UnixListener::bind(path).map_err(io_err("bind"))?)
            }
            Endpoint::Tcp(addr) => {
                EndpointListener::Tcp(TcpListener::bind(addr).map_err(io_err("bind"))?)
            }
        };
        info!("listening on {}", self);
        Ok(listener)
    }
}

pub enum EndpointListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl EndpointListener {
    /// Block until a peer connects, returning its channel and a printable address.
    pub fn accept(
        &self,
        mode: ChannelMode,
        max_frame: usize,
    ) -> Result<(Box<dyn MessageChannel>, String), TransportError> {
        match self {
            EndpointListener::Unix(listener) => {
                let (stream, addr) = listener.accept().map_err(io_err("accept"))?;
                let peer = addr
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix peer".to_string());
                Ok((open_channel(stream, mode, max_frame)?, peer))
            }
            EndpointListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().map_err(io_err("accept"))?;
                stream.set_nodelay(true).map_err(io_err("set nodelay"))?;
                Ok((open_channel(stream, mode, max_frame)?, addr.to_string()))
            }
        }
    }

    /// Actual TCP address, useful after binding port 0.
    pub fn local_tcp_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            EndpointListener::Tcp(listener) => listener.local_addr().ok(),
            EndpointListener::Unix(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transport::{Frame, DEFAULT_MAX_FRAME_BYTES};
    use crate::protocol::Tag;

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            "unix:/tmp/tg.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix("/tmp/tg.sock".into())
        );
        assert_eq!(
            "/run/tg.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix("/run/tg.sock".into())
        );
        assert_eq!(
            "127.0.0.1:7000".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:7000".into())
        );
        assert_eq!(
            "tcp:localhost:1".parse::<Endpoint>().unwrap().to_string(),
            "tcp:localhost:1"
        );
        assert!("nonsense".parse::<Endpoint>().is_err());
        assert!("unix:".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_unix_listener_accepts_connection() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("tg.sock"));
        let listener = endpoint.bind().unwrap();

        let connect_to = endpoint.clone();
        let peer = std::thread::spawn(move || {
            let mut ch = connect_to
                .connect(ChannelMode::Cooperative, DEFAULT_MAX_FRAME_BYTES)
                .unwrap();
            ch.send(Frame::new(Tag::GuiHeartbeat, 0, vec![])).unwrap();
            ch
        });

        let (mut ch, _) = listener
            .accept(ChannelMode::Cooperative, DEFAULT_MAX_FRAME_BYTES)
            .unwrap();
        let frame = ch.recv().unwrap().unwrap();
        assert_eq!(frame.tag(), Ok(Tag::GuiHeartbeat));
        drop(peer.join().unwrap());
    }
}
