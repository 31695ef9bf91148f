//! Device probe — one signed info request to a resolved relay.
//!
//! Online iff a reply arrives before the deadline, verifies, carries a
//! non-error status and a non-empty info record. One attempt per call.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::codec::{self, Credentials, Request, SignContext};
use super::transport::Session;
use super::{Endpoint, ProbeError, Prober};

pub struct DeviceProber {
    timeout: Duration,
    creds: Arc<Credentials>,
    /// Send `/probe/device/<serial>` before the info request.
    preflight: bool,
    cseq: AtomicU32,
}

impl DeviceProber {
    pub fn new(timeout: Duration, creds: Arc<Credentials>, preflight: bool) -> Self {
        Self { timeout, creds, preflight, cseq: AtomicU32::new(0) }
    }

    fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    async fn request(&self, session: &Session, path: String) -> Result<codec::Reply, ProbeError> {
        let datagram = codec::sign(&Request::get(path), &self.creds, SignContext::now(self.next_cseq()))?;
        let raw = session.exchange(&datagram).await?;
        let reply = codec::verify(&raw)?;
        if reply.is_error() {
            return Err(ProbeError::Rejected(reply.code));
        }
        Ok(reply)
    }
}

#[async_trait]
impl Prober for DeviceProber {
    async fn probe(&self, endpoint: &Endpoint, serial: &str) -> Result<(), ProbeError> {
        // The deadline covers lookup, preflight and info together.
        let session = Session::open(&endpoint.host, endpoint.port, self.timeout).await?;

        if self.preflight {
            self.request(&session, format!("/probe/device/{}", serial)).await?;
        }
        let info = self.request(&session, format!("/info/device/{}", serial)).await?;
        info.info_record()?;
        Ok(())
    }
}
