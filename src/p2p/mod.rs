//! P2P cloud protocol client — resolver and device probe.
//!
//! The scanner only talks to the `Resolver` and `Prober` traits. The
//! production implementations speak the vendor's signed datagram protocol;
//! tests plug in fakes.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub mod codec;
pub mod probe;
pub mod resolver;
pub mod transport;

pub use codec::{Credentials, EncodingError, FormatError};

// ── Core Types ──────────────────────────────────────────────────────

/// A rendezvous address. Valid for one probe only; never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse the `host:port` form the discovery service returns.
    pub fn parse(raw: &str) -> Option<Self> {
        let (host, port) = raw.trim().rsplit_once(':')?;
        let host = host.trim().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        let port: u16 = port.trim().parse().ok()?;
        if port == 0 {
            return None;
        }
        Some(Self { host: host.to_string(), port })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("device not registered with discovery service: {0}")]
    NotFound(String),
    #[error("discovery network error: {0}")]
    Network(String),
    #[error("discovery service did not answer in time")]
    Timeout,
    /// Local fault; aborts the whole cycle.
    #[error("local fault: {0}")]
    Local(String),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("device did not answer in time")]
    Timeout,
    #[error("probe network error: {0}")]
    Network(String),
    #[error("malformed device reply: {0}")]
    Format(#[from] FormatError),
    #[error("device rejected the request with code {0}")]
    Rejected(u16),
    /// Local fault; aborts the whole cycle.
    #[error("local fault: {0}")]
    Local(String),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl From<transport::ExchangeError> for ResolveError {
    fn from(e: transport::ExchangeError) -> Self {
        use transport::ExchangeError::*;
        match e {
            Local(io) => Self::Local(io.to_string()),
            Timeout(_) => Self::Timeout,
            other => Self::Network(other.to_string()),
        }
    }
}

impl From<transport::ExchangeError> for ProbeError {
    fn from(e: transport::ExchangeError) -> Self {
        use transport::ExchangeError::*;
        match e {
            Local(io) => Self::Local(io.to_string()),
            Timeout(_) => Self::Timeout,
            other => Self::Network(other.to_string()),
        }
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Why a device was classified offline. Diagnostic only; never part of
/// the externally visible status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ResolveNotFound,
    ResolveNetwork,
    ResolveTimeout,
    ProbeTimeout,
    ProbeNetwork,
    MalformedResponse,
    Rejected,
    Encoding,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ResolveNotFound => "resolve_not_found",
            Self::ResolveNetwork => "resolve_network",
            Self::ResolveTimeout => "resolve_timeout",
            Self::ProbeTimeout => "probe_timeout",
            Self::ProbeNetwork => "probe_network",
            Self::MalformedResponse => "malformed_response",
            Self::Rejected => "rejected",
            Self::Encoding => "encoding",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Online,
    Offline,
}

/// Result of one resolve+probe task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub reachability: Reachability,
    pub reason: Option<FailureReason>,
}

impl ProbeOutcome {
    pub fn online() -> Self {
        Self { reachability: Reachability::Online, reason: None }
    }

    pub fn offline(reason: FailureReason) -> Self {
        Self { reachability: Reachability::Offline, reason: Some(reason) }
    }

    pub fn is_online(&self) -> bool {
        self.reachability == Reachability::Online
    }
}

/// A failure that is not about the device but about this host.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct LocalFault(pub String);

impl ResolveError {
    /// Map to the offline reason, or surface a local fault.
    pub fn classify(&self) -> Result<FailureReason, LocalFault> {
        match self {
            Self::NotFound(_) => Ok(FailureReason::ResolveNotFound),
            Self::Network(_) => Ok(FailureReason::ResolveNetwork),
            Self::Timeout => Ok(FailureReason::ResolveTimeout),
            Self::Encoding(_) => Ok(FailureReason::Encoding),
            Self::Local(msg) => Err(LocalFault(msg.clone())),
        }
    }
}

impl ProbeError {
    pub fn classify(&self) -> Result<FailureReason, LocalFault> {
        match self {
            Self::Timeout => Ok(FailureReason::ProbeTimeout),
            Self::Network(_) => Ok(FailureReason::ProbeNetwork),
            Self::Format(_) => Ok(FailureReason::MalformedResponse),
            Self::Rejected(_) => Ok(FailureReason::Rejected),
            Self::Encoding(_) => Ok(FailureReason::Encoding),
            Self::Local(msg) => Err(LocalFault(msg.clone())),
        }
    }
}

// ── Traits ──────────────────────────────────────────────────────────

/// Looks up the current rendezvous address of a device.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// One request per call, bounded by the resolver's own timeout.
    async fn resolve(&self, serial: &str) -> Result<Endpoint, ResolveError>;
}

/// Tests whether a device answers at a resolved endpoint.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Exactly one attempt; no retries.
    async fn probe(&self, endpoint: &Endpoint, serial: &str) -> Result<(), ProbeError>;
}

/// Resolve then probe one device, folding every device-side failure into
/// an offline outcome.
pub async fn check_device(
    resolver: &dyn Resolver,
    prober: &dyn Prober,
    serial: &str,
) -> Result<ProbeOutcome, LocalFault> {
    let endpoint = match resolver.resolve(serial).await {
        Ok(ep) => ep,
        Err(e) => {
            let reason = e.classify()?;
            tracing::debug!(serial = %serial, reason = %reason, error = %e, "Resolve failed");
            return Ok(ProbeOutcome::offline(reason));
        }
    };

    match prober.probe(&endpoint, serial).await {
        Ok(()) => {
            tracing::debug!(serial = %serial, endpoint = %endpoint, "Device online");
            Ok(ProbeOutcome::online())
        }
        Err(e) => {
            let reason = e.classify()?;
            tracing::debug!(serial = %serial, endpoint = %endpoint, reason = %reason, error = %e, "Probe failed");
            Ok(ProbeOutcome::offline(reason))
        }
    }
}
