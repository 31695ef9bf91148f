//! Scan orchestrator — one cycle probes the whole fleet through a bounded
//! pool and commits all results to the status cache at once.
//!
//! At most one cycle runs at a time. A caller that asks for a scan while
//! one is in flight waits for it and receives the same [`CycleReport`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::inventory::Inventory;
use crate::p2p::{self, FailureReason, LocalFault, Prober, Resolver};
use crate::status::cache::StagedResult;
use crate::status::{DeviceStatus, StatusCache};

pub mod poller;

#[cfg(test)]
pub(crate) mod testing;

/// Where a cycle gets the list of serials to probe.
pub trait SerialSource: Send + Sync {
    fn serials(&self) -> Vec<String>;
}

impl SerialSource for Inventory {
    fn serials(&self) -> Vec<String> {
        Inventory::serials(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// This host could not probe at all; nothing was committed.
    #[error("scan aborted by local fault: {0}")]
    LocalFault(String),
    #[error("scan cancelled")]
    Cancelled,
    /// The cycle task died without publishing a result.
    #[error("scan cycle ended without a result")]
    Abandoned,
}

/// Summary of one committed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub probed: usize,
    pub online: usize,
    pub offline: usize,
    /// Results dropped at commit (serial invalidated or removed mid-cycle).
    pub stale: usize,
    pub reasons: BTreeMap<FailureReason, usize>,
}

type CycleResult = Result<CycleReport, ScanError>;
type InFlight = watch::Receiver<Option<CycleResult>>;

pub struct Scanner {
    source: Arc<dyn SerialSource>,
    cache: Arc<StatusCache>,
    resolver: Arc<dyn Resolver>,
    prober: Arc<dyn Prober>,
    concurrency: usize,
    cancel: CancellationToken,
    in_flight: Mutex<Option<InFlight>>,
}

/// Clears the in-flight slot when the cycle task ends, panics included.
struct SlotGuard(Arc<Scanner>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.in_flight.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl Scanner {
    pub fn new(
        source: Arc<dyn SerialSource>,
        cache: Arc<StatusCache>,
        resolver: Arc<dyn Resolver>,
        prober: Arc<dyn Prober>,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            cache,
            resolver,
            prober,
            concurrency: concurrency.max(1),
            cancel,
            in_flight: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    pub fn is_scanning(&self) -> bool {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Run a cycle, or join the one already running.
    pub async fn scan(self: &Arc<Self>) -> CycleResult {
        let mut rx = {
            let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(rx) => {
                    debug!("Scan already in flight, waiting for it");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    let this = Arc::clone(self);
                    // Spawned so a caller dropping its future never strands the others.
                    tokio::spawn(async move {
                        let guard = SlotGuard(Arc::clone(&this));
                        let result = this.run_cycle().await;
                        drop(guard);
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };

        let result = match rx.wait_for(Option::is_some).await {
            Ok(done) => (*done).clone().unwrap_or(Err(ScanError::Abandoned)),
            Err(_) => Err(ScanError::Abandoned),
        };
        result
    }

    async fn run_cycle(&self) -> CycleResult {
        if self.cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();

        self.cache.sync_roster_from(|| self.source.serials());
        let targets = self.cache.targets();
        let probed = targets.len();
        info!(cycle = %cycle_id, devices = probed, workers = self.concurrency, "Scan cycle starting");

        // Serial -> epoch for targets whose task has not reported back yet.
        let mut pending: HashMap<String, u64> = targets.iter().map(|t| (t.serial.clone(), t.epoch)).collect();

        let pool = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for target in targets {
            let pool = Arc::clone(&pool);
            let resolver = Arc::clone(&self.resolver);
            let prober = Arc::clone(&self.prober);
            tasks.spawn(async move {
                let outcome = match pool.acquire_owned().await {
                    Ok(_permit) => p2p::check_device(resolver.as_ref(), prober.as_ref(), &target.serial).await,
                    Err(_) => Err(LocalFault("probe pool closed".into())),
                };
                (target, outcome)
            });
        }

        let mut staged = Vec::with_capacity(probed);
        let mut reasons: BTreeMap<FailureReason, usize> = BTreeMap::new();
        let (mut online, mut offline) = (0usize, 0usize);

        loop {
            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tasks.abort_all();
                    warn!(cycle = %cycle_id, "Scan cycle cancelled, discarding results");
                    return Err(ScanError::Cancelled);
                }
                next = tasks.join_next() => next,
            };
            let Some(joined) = joined else { break };

            let (target, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(cycle = %cycle_id, error = %e, "Probe task failed");
                    continue;
                }
            };
            pending.remove(&target.serial);

            let outcome = match outcome {
                Ok(o) => o,
                Err(fault) => {
                    tasks.abort_all();
                    error!(cycle = %cycle_id, serial = %target.serial, error = %fault, "Local fault, aborting scan cycle");
                    return Err(ScanError::LocalFault(fault.0));
                }
            };

            let status = if outcome.is_online() {
                online += 1;
                DeviceStatus::Online
            } else {
                offline += 1;
                if let Some(reason) = outcome.reason {
                    *reasons.entry(reason).or_default() += 1;
                }
                DeviceStatus::Offline
            };
            staged.push(StagedResult { serial: target.serial, epoch: target.epoch, status });
        }

        // A probe task that died still gets a verdict for this cycle.
        for (serial, epoch) in pending {
            warn!(cycle = %cycle_id, serial = %serial, "No probe result, marking offline");
            offline += 1;
            staged.push(StagedResult { serial, epoch, status: DeviceStatus::Offline });
        }

        let finished_at = Utc::now();
        let summary = self.cache.commit(&staged, finished_at);

        info!(
            cycle = %cycle_id,
            probed,
            online,
            offline,
            stale = summary.stale,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "Scan cycle committed"
        );

        Ok(CycleReport {
            cycle_id,
            started_at,
            finished_at,
            probed,
            online,
            offline,
            stale: summary.stale,
            reasons,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::status::{Stats, StatusFilter};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn scanner(
        source: Arc<FixedSource>,
        resolver: Arc<FakeResolver>,
        prober: Arc<FakeProber>,
        concurrency: usize,
    ) -> Arc<Scanner> {
        Arc::new(Scanner::new(
            source,
            Arc::new(StatusCache::new()),
            resolver,
            prober,
            concurrency,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_cycle_classifies_fleet() {
        let source = FixedSource::new(&["A", "B", "C"]);
        let s = scanner(source, FakeResolver::not_found(&["C"]), FakeProber::instant(), 20);

        let report = s.scan().await.unwrap();
        assert_eq!((report.probed, report.online, report.offline), (3, 2, 1));
        assert_eq!(report.reasons.get(&FailureReason::ResolveNotFound), Some(&1));

        let cache = s.cache();
        assert_eq!(cache.aggregate_stats(), Stats { total: 3, online: 2, offline: 1 });
        assert_eq!(cache.get("C").unwrap().status, DeviceStatus::Offline);
        assert_eq!(cache.last_updated(), Some(report.finished_at));
    }

    #[tokio::test]
    async fn test_probe_timeout_is_offline() {
        let prober = Arc::new(FakeProber { silent: ["B".to_string()].into(), ..Default::default() });
        let s = scanner(FixedSource::new(&["A", "B"]), Arc::new(FakeResolver::default()), prober, 4);

        let report = s.scan().await.unwrap();
        assert_eq!(report.reasons.get(&FailureReason::ProbeTimeout), Some(&1));
        assert_eq!(s.cache().get("B").unwrap().status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn test_every_entry_resolved_after_cycle() {
        let s = scanner(
            FixedSource::new(&["A", "B", "C", "D"]),
            FakeResolver::not_found(&["B", "D"]),
            FakeProber::instant(),
            2,
        );
        s.scan().await.unwrap();
        assert!(s
            .cache()
            .list(StatusFilter::All)
            .iter()
            .all(|e| matches!(e.status, DeviceStatus::Online | DeviceStatus::Offline)));
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrent_probes() {
        let serials: Vec<String> = (0..12).map(|i| format!("SN{}", i)).collect();
        let refs: Vec<&str> = serials.iter().map(String::as_str).collect();
        let prober = FakeProber::slow(Duration::from_millis(20));
        let s = scanner(FixedSource::new(&refs), Arc::new(FakeResolver::default()), prober.clone(), 3);

        s.scan().await.unwrap();
        assert_eq!(prober.calls(), 12);
        assert!(prober.max_in_flight() <= 3, "max in flight {}", prober.max_in_flight());
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_cycle() {
        let prober = FakeProber::slow(Duration::from_millis(100));
        let s = scanner(FixedSource::new(&["A"]), Arc::new(FakeResolver::default()), prober.clone(), 1);

        let (first, second) = tokio::join!(s.scan(), s.scan());
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.cycle_id, second.cycle_id);
        assert_eq!(prober.calls(), 1);
        assert_eq!(prober.max_in_flight(), 1);
        assert!(!s.is_scanning());

        let third = s.scan().await.unwrap();
        assert_ne!(third.cycle_id, first.cycle_id);
        assert_eq!(prober.calls(), 2);
    }

    #[tokio::test]
    async fn test_panicked_probe_reads_offline() {
        let prober = Arc::new(FakeProber { panics: ["B".to_string()].into(), ..Default::default() });
        let s = scanner(FixedSource::new(&["A", "B"]), Arc::new(FakeResolver::default()), prober, 2);

        let report = s.scan().await.unwrap();
        assert_eq!((report.probed, report.online, report.offline), (2, 1, 1));
        assert_eq!(s.cache().get("A").unwrap().status, DeviceStatus::Online);
        let b = s.cache().get("B").unwrap();
        assert_eq!(b.status, DeviceStatus::Offline);
        assert_eq!(b.last_checked_at, Some(report.finished_at));
    }

    #[tokio::test]
    async fn test_panicked_probe_replaces_previous_status() {
        let s = scanner(FixedSource::new(&["A"]), Arc::new(FakeResolver::default()), FakeProber::instant(), 1);
        s.scan().await.unwrap();
        assert_eq!(s.cache().get("A").unwrap().status, DeviceStatus::Online);

        let panicking = Arc::new(FakeProber { panics: ["A".to_string()].into(), ..Default::default() });
        let s = Arc::new(Scanner::new(
            FixedSource::new(&["A"]),
            Arc::clone(s.cache()),
            Arc::new(FakeResolver::default()),
            panicking,
            1,
            CancellationToken::new(),
        ));
        s.scan().await.unwrap();
        assert_eq!(s.cache().get("A").unwrap().status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn test_local_fault_commits_nothing() {
        let s = scanner(
            FixedSource::new(&["A", "B"]),
            FakeResolver::local_fault(&["B"]),
            FakeProber::instant(),
            1,
        );

        let err = s.scan().await.unwrap_err();
        assert!(matches!(err, ScanError::LocalFault(_)));
        assert_eq!(s.cache().get("A").unwrap().status, DeviceStatus::Unknown);
        assert_eq!(s.cache().last_updated(), None);
        assert!(!s.is_scanning());
    }

    #[tokio::test]
    async fn test_cancel_discards_partial_results() {
        let cancel = CancellationToken::new();
        let prober = FakeProber::slow(Duration::from_secs(10));
        let s = Arc::new(Scanner::new(
            FixedSource::new(&["A", "B"]),
            Arc::new(StatusCache::new()),
            Arc::new(FakeResolver::default()),
            prober,
            2,
            cancel.clone(),
        ));

        let pending = tokio::spawn({
            let s = Arc::clone(&s);
            async move { s.scan().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
        assert_eq!(result, Err(ScanError::Cancelled));
        assert_eq!(s.cache().last_updated(), None);
        assert_eq!(s.cache().aggregate_stats(), Stats { total: 2, online: 0, offline: 2 });
        assert_eq!(s.cache().get("A").unwrap().status, DeviceStatus::Unknown);
    }

    #[tokio::test]
    async fn test_invalidation_mid_cycle_drops_stale_result() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let prober = FakeProber::gated(started.clone(), release.clone());
        let s = scanner(FixedSource::new(&["A"]), Arc::new(FakeResolver::default()), prober, 1);

        let pending = tokio::spawn({
            let s = Arc::clone(&s);
            async move { s.scan().await }
        });
        started.notified().await;
        s.cache().invalidate("A").unwrap();
        release.notify_one();

        let report = pending.await.unwrap().unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(s.cache().get("A").unwrap().status, DeviceStatus::Unknown);
    }

    #[tokio::test]
    async fn test_roster_follows_source_between_cycles() {
        let source = FixedSource::new(&["A", "B"]);
        let s = scanner(source.clone(), Arc::new(FakeResolver::default()), FakeProber::instant(), 2);
        s.scan().await.unwrap();

        source.set(&["B", "C"]);
        let report = s.scan().await.unwrap();
        assert_eq!(report.probed, 2);
        assert!(s.cache().get("A").is_err());
        assert_eq!(s.cache().get("C").unwrap().status, DeviceStatus::Online);
    }
}
