use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};

use crate::{AppError, AppResult, NetworkConfig};

/// Immutable description of a remote or local address plus keep-alive
/// policy. Owns creation of the raw transport handles; everything above it
/// works against already-connected streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    /// 0 leaves the OS keep-alive default untouched.
    keep_alive_secs: u64,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
            keep_alive_secs: 0,
        }
    }

    pub fn with_keep_alive(mut self, secs: u64) -> Endpoint {
        self.keep_alive_secs = secs;
        self
    }

    pub fn from_config(config: &NetworkConfig) -> Endpoint {
        Endpoint::new(config.ip.clone(), config.port).with_keep_alive(config.keep_alive_secs)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connects to the remote side and applies the keep-alive policy.
    pub async fn connect(&self) -> AppResult<TcpStream> {
        let stream = TcpStream::connect(self.address()).await?;
        self.apply_keep_alive(&stream)?;
        Ok(stream)
    }

    /// Binds a listener with an explicit backlog.
    pub async fn listen(&self, backlog: u32) -> AppResult<TcpListener> {
        let addr = lookup_host(self.address())
            .await?
            .next()
            .ok_or_else(|| {
                AppError::InvalidValue(format!("cannot resolve listen address {}", self.address()))
            })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(backlog)?;
        Ok(listener)
    }

    /// Sets TCP keep-alive on an accepted or connected stream when the
    /// endpoint carries a nonzero interval.
    pub fn apply_keep_alive(&self, stream: &TcpStream) -> std::io::Result<()> {
        if self.keep_alive_secs == 0 {
            return Ok(());
        }
        let params = TcpKeepalive::new()
            .with_time(Duration::from_secs(self.keep_alive_secs))
            .with_interval(Duration::from_secs(self.keep_alive_secs));
        let sock = SockRef::from(stream);
        sock.set_tcp_keepalive(&params)
    }
}
