//! Discovery resolver — asks the P2P cloud where a device's relay lives.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::codec::{self, Credentials, Request, SignContext};
use super::transport::Session;
use super::{Endpoint, ResolveError, Resolver};

/// Resolves serials via `DHGET /online/p2psrv/<serial>`.
pub struct DiscoveryResolver {
    host: String,
    port: u16,
    timeout: Duration,
    creds: Arc<Credentials>,
    cseq: AtomicU32,
}

impl DiscoveryResolver {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration, creds: Arc<Credentials>) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            creds,
            cseq: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Resolver for DiscoveryResolver {
    async fn resolve(&self, serial: &str) -> Result<Endpoint, ResolveError> {
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let datagram = codec::sign(
            &Request::get(format!("/online/p2psrv/{}", serial)),
            &self.creds,
            SignContext::now(cseq),
        )?;

        let session = Session::open(&self.host, self.port, self.timeout).await?;
        let raw = session.exchange(&datagram).await?;

        let reply = codec::verify(&raw)
            .map_err(|e| ResolveError::Network(format!("unreadable discovery reply: {}", e)))?;
        endpoint_from_reply(serial, &reply)
    }
}

/// Interpret a discovery reply. Anything short of a usable `host:port` means
/// the cloud has no relay for this device.
fn endpoint_from_reply(serial: &str, reply: &codec::Reply) -> Result<Endpoint, ResolveError> {
    if reply.is_error() {
        return Err(ResolveError::NotFound(format!(
            "{} (discovery answered {} {})",
            serial, reply.code, reply.reason
        )));
    }
    let us = reply
        .body
        .as_ref()
        .and_then(|b| b.find("US"))
        .map(|n| n.text.as_str())
        .unwrap_or("");
    Endpoint::parse(us).ok_or_else(|| {
        ResolveError::NotFound(format!("{} (no relay address in reply: {:?})", serial, us))
    })
}
