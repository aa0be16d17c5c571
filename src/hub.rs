//! Connection-scoped background broadcaster: one polling task per process
//! (started idempotently on first subscribe), fanning each snapshot out to
//! every live subscriber.

use crate::collectors::logs::{aggregate_logs, LogScanError};
use crate::collectors::MetricsProvider;
use crate::metrics::Metrics;
use crate::state::SystemSnapshot;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Broadcaster {
    provider: Arc<dyn MetricsProvider>,
    tick: Duration,
    log_dir: String,
    log_suffix: String,
    stop_when_idle: bool,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
    inner: Mutex<Inner>,
    log_status: RwLock<HashMap<String, u64>>,
}

/// All lifecycle state lives behind one lock so that "start exactly one
/// polling task" and "register a subscriber" cannot race.
struct Inner {
    running: bool,
    generation: u64,
    next_subscriber_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Arc<SystemSnapshot>>>,
    stop_tx: Option<watch::Sender<bool>>,
}

/// A registered output channel. Dropping it deregisters the subscriber;
/// the polling task keeps running for whoever is left.
pub struct Subscription {
    id: u64,
    hub: Arc<Broadcaster>,
    rx: mpsc::UnboundedReceiver<Arc<SystemSnapshot>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<SystemSnapshot>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

impl Broadcaster {
    pub fn new(
        provider: Arc<dyn MetricsProvider>,
        tick: Duration,
        log_dir: impl Into<String>,
        log_suffix: impl Into<String>,
        stop_when_idle: bool,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            tick,
            log_dir: log_dir.into(),
            log_suffix: log_suffix.into(),
            stop_when_idle,
            metrics,
            shutdown,
            inner: Mutex::new(Inner {
                running: false,
                generation: 0,
                next_subscriber_id: 0,
                subscribers: HashMap::new(),
                stop_tx: None,
            }),
            log_status: RwLock::new(HashMap::new()),
        })
    }

    /// Registers a new output channel and starts the polling task if it is
    /// not already running. The check-and-set happens under the state lock,
    /// so concurrent subscribers start at most one task.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, started) = {
            let mut inner = self.lock_inner();
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.insert(id, tx);
            self.metrics.subscribers.set(inner.subscribers.len() as f64);

            let started = if inner.running {
                None
            } else {
                inner.running = true;
                inner.generation += 1;
                let (stop_tx, stop_rx) = watch::channel(false);
                inner.stop_tx = Some(stop_tx);
                Some((inner.generation, stop_rx))
            };
            (id, started)
        };

        if let Some((generation, stop_rx)) = started {
            self.metrics.poll_starts_total.inc();
            info!(generation, tick = ?self.tick, "starting polling task");
            let hub = Arc::clone(self);
            tokio::spawn(async move { hub.run_poll_loop(generation, stop_rx).await });
        }

        Subscription {
            id,
            hub: Arc::clone(self),
            rx,
        }
    }

    /// Removes a channel from the fan-out set. Unknown ids and repeated
    /// calls are no-ops.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.lock_inner();
        if inner.subscribers.remove(&id).is_none() {
            return;
        }
        self.metrics.subscribers.set(inner.subscribers.len() as f64);

        if self.stop_when_idle && inner.running && inner.subscribers.is_empty() {
            inner.running = false;
            if let Some(stop_tx) = inner.stop_tx.take() {
                let _ = stop_tx.send(true);
            }
            info!("last subscriber left, stopping polling task");
        }
    }

    /// Rescans the log directory and replaces the whole summary. On an
    /// unreadable directory the summary becomes empty and the error is
    /// returned so the triggering connect can surface it once.
    pub async fn refresh_logs(&self) -> Result<usize, LogScanError> {
        let dir = self.log_dir.clone();
        let suffix = self.log_suffix.clone();
        let scan_dir = dir.clone();
        let result = match tokio::task::spawn_blocking(move || aggregate_logs(&scan_dir, &suffix))
            .await
        {
            Ok(result) => result,
            Err(err) => Err(LogScanError::DirectoryUnreadable {
                path: dir,
                source: io::Error::new(io::ErrorKind::Other, err),
            }),
        };

        match result {
            Ok(summary) => {
                let count = summary.len();
                self.metrics.log_sources.set(count as f64);
                *self.lock_log_status_write() = summary;
                debug!(sources = count, "log summary refreshed");
                Ok(count)
            }
            Err(err) => {
                self.metrics.log_scan_errors_total.inc();
                self.metrics.log_sources.set(0.0);
                self.lock_log_status_write().clear();
                Err(err)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_inner().running
    }

    /// How many times a polling task has been started over the process
    /// lifetime. Stays at 1 unless `stop_when_idle` restarts occur.
    pub fn generation(&self) -> u64 {
        self.lock_inner().generation
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_inner().subscribers.len()
    }

    pub fn log_status(&self) -> HashMap<String, u64> {
        self.log_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run_poll_loop(self: Arc<Self>, generation: u64, mut stop_rx: watch::Receiver<bool>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(generation, "shutdown received, polling task exiting");
                    break;
                }
                _ = stop_rx.changed() => {
                    debug!(generation, "polling task stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.metrics.ticks_total.inc();
                    let provider = Arc::clone(&self.provider);
                    let sample = match tokio::task::spawn_blocking(move || provider.sample()).await {
                        Ok(Ok(sample)) => sample,
                        Ok(Err(err)) => {
                            self.metrics.sample_errors_total.inc();
                            warn!(error = %err, "metrics provider unavailable, skipping tick");
                            continue;
                        }
                        Err(err) => {
                            self.metrics.sample_errors_total.inc();
                            warn!(error = %err, "sample task failed, skipping tick");
                            continue;
                        }
                    };
                    if *stop_rx.borrow() {
                        break;
                    }

                    let snapshot = Arc::new(SystemSnapshot {
                        cpu: sample.cpu,
                        memory: sample.memory,
                        storage: sample.storage,
                        log_status: self.log_status(),
                        system_info: sample.system_info,
                    });
                    self.fan_out(snapshot);
                }
            }
        }
    }

    /// Delivers one snapshot to every channel registered at send time. The
    /// set is copied under the lock and released before sending, so churn
    /// during a fan-out cannot corrupt iteration. Channels whose receiver
    /// is gone are pruned afterwards.
    fn fan_out(&self, snapshot: Arc<SystemSnapshot>) {
        let targets: Vec<(u64, mpsc::UnboundedSender<Arc<SystemSnapshot>>)> = self
            .lock_inner()
            .subscribers
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0_u64;
        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.send(Arc::clone(&snapshot)).is_ok() {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }
        self.metrics.snapshots_delivered_total.inc_by(delivered as f64);

        for id in dead {
            debug!(subscriber = id, "pruning dead channel");
            self.unsubscribe(id);
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_log_status_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, u64>> {
        self.log_status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{HostSample, SampleError};
    use crate::state::{
        CpuStat, MemoryStat, StorageStat, SystemInfoStat, Temperature, UptimeStat,
    };
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    const TICK: Duration = Duration::from_millis(10);

    struct FakeProvider {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl FakeProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl MetricsProvider for FakeProvider {
        fn sample(&self) -> Result<HostSample, SampleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SampleError::CpuUnavailable);
            }
            Ok(fake_sample())
        }
    }

    fn fake_sample() -> HostSample {
        HostSample {
            cpu: CpuStat {
                processor: "Fake CPU".to_string(),
                current_ghz: 1.8,
                min_ghz: 0.4,
                max_ghz: 3.6,
                temperature: Temperature::Celsius(40.0),
                load_percent: 90.0,
            },
            memory: MemoryStat {
                percent: 50.0,
                total_gib: 8.0,
                used_gib: 4.0,
            },
            storage: StorageStat {
                percent: 25.0,
                total_gib: 200.0,
                used_gib: 50.0,
            },
            system_info: SystemInfoStat {
                uptime: UptimeStat {
                    days: 0,
                    hours: 5,
                    minutes: 30,
                },
                os: "Linux".to_string(),
                os_version: "test".to_string(),
            },
        }
    }

    fn test_hub(
        provider: Arc<FakeProvider>,
        stop_when_idle: bool,
    ) -> (Arc<Broadcaster>, watch::Sender<bool>) {
        let metrics = Metrics::new().expect("metrics init");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let hub = Broadcaster::new(
            provider,
            TICK,
            "/nonexistent-log-dir",
            "_access.log",
            stop_when_idle,
            metrics,
            shutdown_rx,
        );
        (hub, shutdown_tx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_subscribes_start_exactly_one_task() {
        let provider = FakeProvider::new();
        let (hub, _shutdown_tx) = test_hub(provider, false);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move { hub.subscribe() })
            })
            .collect();
        let mut subscriptions = Vec::new();
        for handle in handles {
            subscriptions.push(handle.await.expect("subscribe task"));
        }

        assert_eq!(hub.generation(), 1);
        assert!(hub.is_running());
        assert_eq!(hub.subscriber_count(), 16);
    }

    #[tokio::test]
    async fn task_survives_all_disconnects() {
        let provider = FakeProvider::new();
        let (hub, _shutdown_tx) = test_hub(Arc::clone(&provider), false);

        let subscriptions: Vec<_> = (0..3).map(|_| hub.subscribe()).collect();
        drop(subscriptions);

        assert_eq!(hub.subscriber_count(), 0);
        assert!(hub.is_running(), "disconnects must not stop the poll loop");

        let before = provider.calls();
        sleep(TICK * 5).await;
        assert!(provider.calls() > before, "poll loop must keep ticking");
        assert_eq!(hub.generation(), 1);
    }

    #[tokio::test]
    async fn stop_when_idle_stops_and_restarts() {
        let provider = FakeProvider::new();
        let (hub, _shutdown_tx) = test_hub(Arc::clone(&provider), true);

        let subscription = hub.subscribe();
        assert!(hub.is_running());
        drop(subscription);
        assert!(!hub.is_running());

        // Let any in-flight tick drain, then confirm the loop is gone.
        sleep(TICK * 3).await;
        let settled = provider.calls();
        sleep(TICK * 5).await;
        assert_eq!(provider.calls(), settled);

        let _subscription = hub.subscribe();
        assert!(hub.is_running());
        assert_eq!(hub.generation(), 2);
    }

    #[tokio::test]
    async fn fan_out_delivers_same_snapshot_to_every_channel() {
        let provider = FakeProvider::new();
        let (hub, _shutdown_tx) = test_hub(provider, false);

        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        let mut c = hub.subscribe();

        let deadline = Duration::from_secs(5);
        let snap_a = timeout(deadline, a.recv()).await.unwrap().unwrap();
        let snap_b = timeout(deadline, b.recv()).await.unwrap().unwrap();
        let snap_c = timeout(deadline, c.recv()).await.unwrap().unwrap();

        assert_eq!(*snap_a, *snap_b);
        assert_eq!(*snap_b, *snap_c);
        assert_eq!(snap_a.cpu.load_percent, 90.0);
    }

    #[tokio::test]
    async fn provider_errors_skip_the_whole_tick() {
        let provider = FakeProvider::new();
        provider.fail.store(true, Ordering::SeqCst);
        let (hub, _shutdown_tx) = test_hub(Arc::clone(&provider), false);

        let mut subscription = hub.subscribe();
        let received = timeout(TICK * 8, subscription.recv()).await;
        assert!(received.is_err(), "failed ticks must deliver nothing");
        assert!(hub.is_running(), "failed ticks must not kill the loop");

        provider.fail.store(false, Ordering::SeqCst);
        let snapshot = timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("loop should recover")
            .expect("channel should stay open");
        assert_eq!(snapshot.memory.percent, 50.0);
    }

    #[tokio::test]
    async fn unknown_and_double_unsubscribe_are_noops() {
        let provider = FakeProvider::new();
        let (hub, _shutdown_tx) = test_hub(provider, false);

        hub.unsubscribe(12345);

        let keeper = hub.subscribe();
        let id = {
            let goner = hub.subscribe();
            goner.id()
        };
        hub.unsubscribe(id);
        hub.unsubscribe(id);

        assert_eq!(hub.subscriber_count(), 1);
        assert!(hub.is_running());
        drop(keeper);
    }

    #[tokio::test]
    async fn refresh_logs_replaces_summary_and_feeds_snapshots() {
        let provider = FakeProvider::new();
        let metrics = Metrics::new().expect("metrics init");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("blog_access.log")).unwrap();
        writeln!(file, "1.2.3.4 - - [x] \"GET / HTTP/1.1\" 200 100 \"-\" \"-\"").unwrap();

        let hub = Broadcaster::new(
            provider,
            TICK,
            dir.path().display().to_string(),
            "_access.log",
            false,
            metrics,
            shutdown_rx,
        );

        let count = hub.refresh_logs().await.expect("scan should succeed");
        assert_eq!(count, 1);
        assert_eq!(hub.log_status().get("blog"), Some(&1));

        let mut subscription = hub.subscribe();
        let snapshot = timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.log_status.get("blog"), Some(&1));
    }

    #[tokio::test]
    async fn unreadable_directory_empties_the_summary() {
        let provider = FakeProvider::new();
        let (hub, _shutdown_tx) = test_hub(provider, false);

        hub.lock_log_status_write()
            .insert("stale".to_string(), 7);

        let err = hub.refresh_logs().await.unwrap_err();
        assert!(matches!(err, LogScanError::DirectoryUnreadable { .. }));
        assert!(hub.log_status().is_empty());
    }
}
