//! In-process resolver/prober doubles shared by scanner and fleet tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use super::SerialSource;
use crate::p2p::{Endpoint, ProbeError, Prober, ResolveError, Resolver};

/// A roster that tests can change between cycles. Counts reads, one per
/// cycle that gets past the cancel check.
#[derive(Default)]
pub struct FixedSource {
    serials: Mutex<Vec<String>>,
    reads: AtomicUsize,
}

impl FixedSource {
    pub fn new(serials: &[&str]) -> Arc<Self> {
        let source = Self::default();
        source.set(serials);
        Arc::new(source)
    }

    pub fn set(&self, serials: &[&str]) {
        *self.serials.lock().unwrap() = serials.iter().map(|s| s.to_string()).collect();
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl SerialSource for FixedSource {
    fn serials(&self) -> Vec<String> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.serials.lock().unwrap().clone()
    }
}

/// Serials in `unknown` are not registered; `local` fails as a host fault;
/// everything else resolves to a dummy relay.
#[derive(Default)]
pub struct FakeResolver {
    pub unknown: HashSet<String>,
    pub local: HashSet<String>,
}

impl FakeResolver {
    pub fn not_found(serials: &[&str]) -> Arc<Self> {
        Arc::new(Self { unknown: serials.iter().map(|s| s.to_string()).collect(), ..Default::default() })
    }

    pub fn local_fault(serials: &[&str]) -> Arc<Self> {
        Arc::new(Self { local: serials.iter().map(|s| s.to_string()).collect(), ..Default::default() })
    }
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn resolve(&self, serial: &str) -> Result<Endpoint, ResolveError> {
        if self.local.contains(serial) {
            return Err(ResolveError::Local("no sockets left".into()));
        }
        if self.unknown.contains(serial) {
            return Err(ResolveError::NotFound(serial.to_string()));
        }
        Ok(Endpoint { host: "relay.test".into(), port: 8801 })
    }
}

/// Answers every probe after `delay`, tracking how many run at once.
#[derive(Default)]
pub struct FakeProber {
    pub delay: Duration,
    pub silent: HashSet<String>,
    /// Serials whose probe panics.
    pub panics: HashSet<String>,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// When set, each probe signals `started` and then waits on `release`.
    pub gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeProber {
    pub fn instant() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay, ..Default::default() })
    }

    pub fn gated(started: Arc<Notify>, release: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self { gate: Some((started, release)), ..Default::default() })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, _endpoint: &Endpoint, serial: &str) -> Result<(), ProbeError> {
        if self.panics.contains(serial) {
            panic!("prober blew up on {}", serial);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.silent.contains(serial) {
            Err(ProbeError::Timeout)
        } else {
            Ok(())
        }
    }
}
