//! Argus Monitor Supervisor - Periodic tick scheduling and recovery
//!
//! Each active monitor owns one scheduling task: `Scheduled` during its
//! initial delay, `Running` once ticks flow. A process-wide gate bounds
//! concurrent ticks; health and recovery loops restart monitors whose
//! declared state drifted from the runtime map.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::models::Monitor;
use crate::pipeline::ThreatPipeline;
use crate::storage::ArgusStorage;

/// Process-wide bound on concurrently executing ticks.
const MAX_CONCURRENT_TICKS: usize = 2;
/// Deterministic first-run jitter window, in seconds.
const JITTER_WINDOW_SECS: u64 = 90;
/// Stagger between monitors in `start_all`.
const STAGGER_SECS: u64 = 15;
const HEALTH_LOOP_SECS: u64 = 60;
const RECOVERY_LOOP_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Scheduled,
    Running,
}

struct MonitorHandle {
    state: Arc<StdMutex<MonitorState>>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct MonitorSupervisor {
    storage: Arc<ArgusStorage>,
    pipeline: Arc<ThreatPipeline>,
    monitors: Mutex<HashMap<Uuid, MonitorHandle>>,
    gate: Arc<Semaphore>,
    loops: StdMutex<Vec<JoinHandle<()>>>,
    ticks_started: AtomicUsize,
    ticks_skipped: AtomicUsize,
}

/// Deterministic per-monitor jitter: `(hash(id) mod 90)` seconds.
pub fn first_run_jitter(monitor_id: Uuid) -> Duration {
    let bytes = monitor_id.as_bytes();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&bytes[..8]);
    Duration::from_secs(u64::from_le_bytes(prefix) % JITTER_WINDOW_SECS)
}

impl MonitorSupervisor {
    pub fn new(storage: Arc<ArgusStorage>, pipeline: Arc<ThreatPipeline>) -> Self {
        Self {
            storage,
            pipeline,
            monitors: Mutex::new(HashMap::new()),
            gate: Arc::new(Semaphore::new(MAX_CONCURRENT_TICKS)),
            loops: StdMutex::new(Vec::new()),
            ticks_started: AtomicUsize::new(0),
            ticks_skipped: AtomicUsize::new(0),
        }
    }

    /// Mark the monitor active and schedule its tick loop. The first tick
    /// fires after the caller-provided delay, or the deterministic jitter.
    pub async fn start(
        self: &Arc<Self>,
        monitor: &Monitor,
        first_run_delay: Option<Duration>,
    ) -> Result<(), ApiError> {
        self.storage.set_monitor_active(monitor.id, true).await?;

        {
            let monitors = self.monitors.lock().await;
            if let Some(handle) = monitors.get(&monitor.id) {
                if !handle.task.is_finished() {
                    debug!(monitor_id = %monitor.id, "Monitor already scheduled");
                    return Ok(());
                }
            }
        }

        let initial_delay = first_run_delay.unwrap_or_else(|| first_run_jitter(monitor.id));
        let state = Arc::new(StdMutex::new(MonitorState::Scheduled));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(monitor_loop(
            self.clone(),
            monitor.id,
            initial_delay,
            state.clone(),
            stop_rx,
        ));

        let mut monitors = self.monitors.lock().await;
        monitors.insert(
            monitor.id,
            MonitorHandle {
                state,
                stop_tx,
                task,
            },
        );
        info!(monitor_id = %monitor.id, delay_secs = initial_delay.as_secs(), "Monitor scheduled");
        Ok(())
    }

    /// Cancel the pending timer and persist the inactive flag. A currently
    /// executing tick runs to completion.
    pub async fn stop(&self, monitor_id: Uuid) -> Result<(), ApiError> {
        let handle = {
            let mut monitors = self.monitors.lock().await;
            monitors.remove(&monitor_id)
        };
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(true);
        }
        self.storage.set_monitor_active(monitor_id, false).await?;
        info!(monitor_id = %monitor_id, "Monitor stopped");
        Ok(())
    }

    /// Start every active monitor, staggered to avoid a first-run
    /// thundering herd.
    pub async fn start_all(self: &Arc<Self>) -> Result<usize, ApiError> {
        let monitors = self.storage.list_monitors(true).await?;
        let mut started = 0;
        for (index, monitor) in monitors.iter().enumerate() {
            let delay = Duration::from_secs(index as u64 * STAGGER_SECS);
            match self.start(monitor, Some(delay)).await {
                Ok(()) => started += 1,
                Err(err) => error!(monitor_id = %monitor.id, error = %err, "Failed to start monitor"),
            }
        }
        info!(started, "Started active monitors");
        Ok(started)
    }

    pub async fn is_running(&self, monitor_id: Uuid) -> bool {
        let monitors = self.monitors.lock().await;
        monitors
            .get(&monitor_id)
            .map(|handle| !handle.task.is_finished())
            .unwrap_or(false)
    }

    pub async fn monitor_state(&self, monitor_id: Uuid) -> Option<MonitorState> {
        let monitors = self.monitors.lock().await;
        monitors
            .get(&monitor_id)
            .filter(|handle| !handle.task.is_finished())
            .map(|handle| *handle.state.lock().expect("state lock"))
    }

    pub async fn running_count(&self) -> usize {
        let monitors = self.monitors.lock().await;
        monitors.values().filter(|h| !h.task.is_finished()).count()
    }

    pub fn tick_counters(&self) -> (usize, usize) {
        (
            self.ticks_started.load(Ordering::Relaxed),
            self.ticks_skipped.load(Ordering::Relaxed),
        )
    }

    /// Spawn the drift-detection loops: health each minute, recovery each
    /// five minutes as an idempotent superset.
    pub fn spawn_loops(self: &Arc<Self>) {
        let health = {
            let supervisor = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(HEALTH_LOOP_SECS));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    supervisor.reconcile("health").await;
                }
            })
        };
        let recovery = {
            let supervisor = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(RECOVERY_LOOP_SECS));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    supervisor.reconcile("recovery").await;
                }
            })
        };
        let mut loops = self.loops.lock().expect("loops lock");
        loops.push(health);
        loops.push(recovery);
    }

    /// Restart any monitor marked active in the store but absent from the
    /// runtime map. Errors are logged and never abort the loop.
    async fn reconcile(self: &Arc<Self>, loop_name: &'static str) {
        let active = match self.storage.list_monitors(true).await {
            Ok(monitors) => monitors,
            Err(err) => {
                error!(loop_name, error = %err, "Reconcile listing failed");
                return;
            }
        };

        {
            let mut monitors = self.monitors.lock().await;
            monitors.retain(|_, handle| !handle.task.is_finished());
        }

        for monitor in active {
            let missing = {
                let monitors = self.monitors.lock().await;
                !monitors.contains_key(&monitor.id)
            };
            if missing {
                warn!(loop_name, monitor_id = %monitor.id, "Monitor drift detected, restarting");
                if let Err(err) = self.start(&monitor, None).await {
                    error!(loop_name, monitor_id = %monitor.id, error = %err, "Restart failed");
                }
            }
        }
    }

    /// Stop the loops and cancel every pending timer. Active flags are left
    /// untouched; the supervisor does not infer intent at shutdown.
    pub async fn shutdown(&self) {
        let loops = {
            let mut loops = self.loops.lock().expect("loops lock");
            std::mem::take(&mut *loops)
        };
        for handle in loops {
            handle.abort();
        }

        let mut monitors = self.monitors.lock().await;
        for (monitor_id, handle) in monitors.drain() {
            let _ = handle.stop_tx.send(true);
            debug!(monitor_id = %monitor_id, "Monitor timer cancelled");
        }
        info!("Monitor supervisor shut down");
    }

    /// Run one tick under the concurrency gate; a saturated gate skips the
    /// tick and the next interval boundary retries.
    async fn gated_tick(&self, monitor: &Monitor) -> bool {
        match self.gate.clone().try_acquire_owned() {
            Ok(_permit) => {
                self.ticks_started.fetch_add(1, Ordering::Relaxed);
                let started = Utc::now();
                let outcome = self.pipeline.run_tick(monitor).await;
                debug!(
                    monitor_id = %monitor.id,
                    elapsed_ms = (Utc::now() - started).num_milliseconds(),
                    new = outcome.new_threats,
                    "Tick finished"
                );
                true
            }
            Err(_) => {
                self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                warn!(monitor_id = %monitor.id, "Concurrency gate saturated, skipping tick");
                false
            }
        }
    }
}

async fn monitor_loop(
    supervisor: Arc<MonitorSupervisor>,
    monitor_id: Uuid,
    initial_delay: Duration,
    state: Arc<StdMutex<MonitorState>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = tokio::time::sleep(initial_delay) => {}
        _ = stop_rx.changed() => return,
    }
    *state.lock().expect("state lock") = MonitorState::Running;

    loop {
        if *stop_rx.borrow() {
            return;
        }

        // Re-read the row each iteration: interval edits and the search
        // cursor must take effect without a restart.
        let monitor = match supervisor.storage.get_monitor(monitor_id).await {
            Ok(monitor) => monitor,
            Err(err) => {
                warn!(monitor_id = %monitor_id, error = %err, "Monitor vanished, ending loop");
                return;
            }
        };

        supervisor.gated_tick(&monitor).await;

        let interval = Duration::from_secs(monitor.interval_seconds.max(60) as u64);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop_rx.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_cache::ConfigCache;
    use crate::llm::LlmClient;
    use crate::sync::tests::RecordingBroadcaster;
    use crate::vault::CredentialVault;

    async fn supervisor_fixture() -> (Arc<MonitorSupervisor>, Arc<ArgusStorage>) {
        let storage = Arc::new(ArgusStorage::new_in_memory().await.unwrap());
        let config = Arc::new(ConfigCache::new(storage.clone()));
        let vault = Arc::new(CredentialVault::new(config.clone(), 24));
        let llm = Arc::new(LlmClient::new(config, vault));
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let pipeline = Arc::new(ThreatPipeline::new(storage.clone(), llm, broadcaster));
        (
            Arc::new(MonitorSupervisor::new(storage.clone(), pipeline)),
            storage,
        )
    }

    async fn seeded_monitor(storage: &ArgusStorage, interval_seconds: i64) -> Monitor {
        let monitor = Monitor {
            id: Uuid::new_v4(),
            area: "Seattle".to_string(),
            focus: None,
            allowed_domains: vec![],
            interval_seconds,
            active: false,
            last_searched_at: None,
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        storage.create_monitor(&monitor).await.unwrap();
        monitor
    }

    #[test]
    fn test_jitter_is_deterministic_and_bounded() {
        let id = Uuid::new_v4();
        assert_eq!(first_run_jitter(id), first_run_jitter(id));
        for _ in 0..64 {
            assert!(first_run_jitter(Uuid::new_v4()).as_secs() < 90);
        }
    }

    /// Advance virtual time one second per iteration while giving the
    /// blocking sqlite threads real time to complete, until the condition
    /// holds. Panics after ~10 virtual minutes.
    macro_rules! wait_until {
        ($cond:expr) => {{
            let mut met = false;
            for _ in 0..600 {
                if $cond {
                    met = true;
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(2));
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            assert!(met, "condition not met: {}", stringify!($cond));
        }};
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_schedules_then_runs_on_interval() {
        let (supervisor, storage) = supervisor_fixture().await;
        let monitor = seeded_monitor(&storage, 60).await;

        supervisor
            .start(&monitor, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(storage.get_monitor(monitor.id).await.unwrap().active);
        assert_eq!(
            supervisor.monitor_state(monitor.id).await,
            Some(MonitorState::Scheduled)
        );
        assert_eq!(supervisor.tick_counters().0, 0);

        // First tick after the initial delay.
        wait_until!(supervisor.tick_counters().0 == 1);
        assert_eq!(
            supervisor.monitor_state(monitor.id).await,
            Some(MonitorState::Running)
        );

        // Second tick one interval later.
        wait_until!(supervisor.tick_counters().0 == 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_ticks_and_persists_flag() {
        let (supervisor, storage) = supervisor_fixture().await;
        let monitor = seeded_monitor(&storage, 60).await;

        supervisor
            .start(&monitor, Some(Duration::ZERO))
            .await
            .unwrap();
        wait_until!(supervisor.tick_counters().0 >= 1);
        assert!(supervisor.is_running(monitor.id).await);

        supervisor.stop(monitor.id).await.unwrap();
        assert!(!storage.get_monitor(monitor.id).await.unwrap().active);
        wait_until!(!supervisor.is_running(monitor.id).await);

        // Two full intervals of virtual time pass with no further ticks.
        let (ticks_at_stop, _) = supervisor.tick_counters();
        for _ in 0..130 {
            std::thread::sleep(std::time::Duration::from_millis(1));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(supervisor.tick_counters().0, ticks_at_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_start_leaves_monitor_running() {
        let (supervisor, storage) = supervisor_fixture().await;
        let monitor = seeded_monitor(&storage, 60).await;

        supervisor.start(&monitor, Some(Duration::ZERO)).await.unwrap();
        supervisor.stop(monitor.id).await.unwrap();
        supervisor.start(&monitor, Some(Duration::ZERO)).await.unwrap();

        wait_until!(supervisor.monitor_state(monitor.id).await == Some(MonitorState::Running));
        assert!(storage.get_monitor(monitor.id).await.unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_all_staggers_and_starts_only_active() {
        let (supervisor, storage) = supervisor_fixture().await;
        let first = seeded_monitor(&storage, 60).await;
        let second = seeded_monitor(&storage, 60).await;
        let inactive = seeded_monitor(&storage, 60).await;
        storage.set_monitor_active(first.id, true).await.unwrap();
        storage.set_monitor_active(second.id, true).await.unwrap();

        let started = supervisor.start_all().await.unwrap();
        assert_eq!(started, 2);
        assert!(supervisor.is_running(first.id).await);
        assert!(supervisor.is_running(second.id).await);
        assert!(!supervisor.is_running(inactive.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_restarts_drifted_monitor() {
        let (supervisor, storage) = supervisor_fixture().await;
        let monitor = seeded_monitor(&storage, 60).await;
        storage.set_monitor_active(monitor.id, true).await.unwrap();

        supervisor.spawn_loops();

        // Within one health period the supervisor converges.
        wait_until!(supervisor.is_running(monitor.id).await);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_timers_but_keeps_flags() {
        let (supervisor, storage) = supervisor_fixture().await;
        let monitor = seeded_monitor(&storage, 60).await;
        supervisor.start(&monitor, Some(Duration::ZERO)).await.unwrap();
        wait_until!(supervisor.tick_counters().0 >= 1);

        supervisor.shutdown().await;
        wait_until!(supervisor.running_count().await == 0);
        // The active flag is not inferred at shutdown.
        assert!(storage.get_monitor(monitor.id).await.unwrap().active);
    }

    #[tokio::test]
    async fn test_saturated_gate_skips_tick() {
        let (supervisor, storage) = supervisor_fixture().await;
        let monitor = seeded_monitor(&storage, 60).await;

        let _first = supervisor.gate.clone().try_acquire_owned().unwrap();
        let _second = supervisor.gate.clone().try_acquire_owned().unwrap();

        assert!(!supervisor.gated_tick(&monitor).await);
        let (started, skipped) = supervisor.tick_counters();
        assert_eq!(started, 0);
        assert_eq!(skipped, 1);

        drop(_first);
        assert!(supervisor.gated_tick(&monitor).await);
    }
}
