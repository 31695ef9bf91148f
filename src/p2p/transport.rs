//! One-shot datagram exchange: bind, send, wait for a single reply.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};

/// Largest reply we accept. Cloud replies fit comfortably.
const MAX_DATAGRAM: usize = 8192;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// No socket could be allocated on this host.
    #[error("local socket unavailable: {0}")]
    Local(#[source] io::Error),
    #[error("cannot resolve {host}: {source}")]
    Lookup { host: String, #[source] source: io::Error },
    #[error("send/receive failed: {0}")]
    Io(#[source] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// A bound UDP socket aimed at one peer, with a deadline shared by every
/// exchange made through it.
pub struct Session {
    socket: UdpSocket,
    peer: SocketAddr,
    deadline: Instant,
    budget: Duration,
}

impl Session {
    /// Resolve `host:port` and bind an ephemeral socket of the matching family.
    pub async fn open(host: &str, port: u16, budget: Duration) -> Result<Self, ExchangeError> {
        let deadline = Instant::now() + budget;
        let lookup = timeout_at(deadline, lookup_host((host, port)))
            .await
            .map_err(|_| ExchangeError::Timeout(budget))?;
        let peer = lookup
            .map_err(|source| ExchangeError::Lookup { host: host.to_string(), source })?
            .next()
            .ok_or_else(|| ExchangeError::Lookup {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            })?;

        let bind: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await.map_err(ExchangeError::Local)?;
        Ok(Self { socket, peer, deadline, budget })
    }

    /// Send one datagram and return the first reply from the peer.
    pub async fn exchange(&self, datagram: &[u8]) -> Result<Vec<u8>, ExchangeError> {
        self.socket
            .send_to(datagram, self.peer)
            .await
            .map_err(ExchangeError::Io)?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = timeout_at(self.deadline, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| ExchangeError::Timeout(self.budget))?;
            let (len, from) = received.map_err(ExchangeError::Io)?;
            // Stray datagrams from other hosts are dropped.
            if from.ip() != self.peer.ip() {
                tracing::debug!(%from, peer = %self.peer, "Ignoring datagram from unexpected peer");
                continue;
            }
            buf.truncate(len);
            return Ok(buf);
        }
    }
}
