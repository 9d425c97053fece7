//! The auto-shelve engine.
//!
//! [`AutoShelve`] owns the schedule and the cached connection. Each run fans
//! out one detached task per qualifying workspace; a task names the
//! candidate shelveset, compares pending changes against the most recent
//! engine-owned shelveset, shelves when something changed and then purges
//! history beyond the configured maximum. Every task reports exactly one
//! [`ShelveEvent::ShelvesetCreated`].
//!
//! Runs are not serialized against each other: with a slow backend, two
//! attempts for the same workspace can overlap (a timer tick racing a manual
//! trigger).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::Local;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{HostContext, VersionControl};
use crate::compare;
use crate::config::{interval_duration, EngineConfig};
use crate::connection::ConnectionLifecycle;
use crate::error::{ShelveError, ShelveResult};
use crate::events::{EventBus, ShelveEvent};
use crate::name;
use crate::retention;
use crate::types::{PendingChange, Shelveset, ShelvesetResult, WorkspaceHandle};

/// Settings captured at the start of a run.
#[derive(Debug, Clone)]
struct RunSettings {
    pattern: String,
    maximum: u16,
}

/// Per-workspace attempts spawned by one run.
///
/// Dropping a run detaches its attempts; they still complete and report.
#[derive(Debug, Default)]
pub struct ShelveRun {
    tasks: Vec<JoinHandle<ShelvesetResult>>,
}

impl ShelveRun {
    /// Number of workspace attempts in this run.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every attempt of this run.
    pub async fn join(self) -> Vec<ShelvesetResult> {
        join_all(self.tasks)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| ShelvesetResult {
                    error: Some(Arc::new(ShelveError::Internal(format!(
                        "shelve attempt aborted: {}",
                        e
                    )))),
                    ..Default::default()
                })
            })
            .collect()
    }
}

struct Inner {
    backend: Arc<dyn VersionControl>,
    connection: ConnectionLifecycle,
    settings: RwLock<EngineConfig>,
    running: AtomicBool,
    schedule: Mutex<Option<JoinHandle<()>>>,
    events: EventBus,
}

impl Inner {
    fn settings(&self) -> EngineConfig {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, edit: impl FnOnce(&mut EngineConfig)) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        edit(&mut *settings);
    }

    fn schedule(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn period(&self) -> Duration {
        self.settings()
            .interval()
            .unwrap_or(Duration::from_secs(5 * 60))
    }

    fn run_settings(&self) -> RunSettings {
        let settings = self.settings();
        RunSettings {
            maximum: settings.effective_maximum(),
            pattern: settings.name_pattern,
        }
    }

    /// Run one workspace attempt and report its result.
    async fn shelve_workspace(
        self: Arc<Self>,
        workspace: WorkspaceHandle,
        settings: RunSettings,
        force: bool,
    ) -> ShelvesetResult {
        let mut result = ShelvesetResult::default();

        if let Err(e) = self
            .attempt(&workspace, &settings, force, &mut result)
            .await
        {
            warn!("Shelving workspace {} failed: {}", workspace.name, e);
            self.connection.invalidate();
            result.change_count = 0;
            result.purge_count = 0;
            result.error = Some(Arc::new(e));
        }

        self.events
            .publish(ShelveEvent::ShelvesetCreated(result.clone()));
        result
    }

    async fn attempt(
        &self,
        workspace: &WorkspaceHandle,
        settings: &RunSettings,
        force: bool,
        result: &mut ShelvesetResult,
    ) -> ShelveResult<()> {
        let resolved = name::resolve(
            &settings.pattern,
            &workspace.name,
            &workspace.owner,
            &Local::now(),
        )?;
        result.shelveset_name = name::sanitize(&resolved);

        let changes = self.backend.pending_changes(workspace).await?;
        if changes.is_empty() {
            debug!("No pending changes in {}", workspace.name);
            return Ok(());
        }

        let history = retention::past_shelvesets(
            self.backend.query_shelvesets(&workspace.owner).await?,
            &workspace.name,
            &settings.pattern,
        );

        if !force && !self.differs_from_latest(&changes, &history).await? {
            debug!(
                "Pending changes in {} match the last shelveset",
                workspace.name
            );
            return Ok(());
        }

        let comment = Shelveset::engine_comment(changes.len());
        let created = self
            .backend
            .create_shelveset(workspace, &result.shelveset_name, &comment, &changes)
            .await?;
        result.change_count = changes.len();
        info!(
            "Shelved {} pending changes of {} into {}",
            changes.len(),
            workspace.name,
            created.name
        );

        // A same-named entry in history was just replaced by the new shelveset
        for old in retention::select_for_purge(&history, settings.maximum)
            .iter()
            .filter(|s| s.name != created.name)
        {
            self.backend.delete_shelveset(old).await?;
            result.purge_count += 1;
            debug!("Purged shelveset {}", old.name);
        }
        if result.purge_count > 0 {
            info!(
                "Purged {} shelvesets beyond the maximum of {}",
                result.purge_count, settings.maximum
            );
        }

        Ok(())
    }

    /// Compare `changes` with those captured by the newest entry of `history`.
    async fn differs_from_latest(
        &self,
        changes: &[PendingChange],
        history: &[Shelveset],
    ) -> ShelveResult<bool> {
        let Some(latest) = history.first() else {
            return Ok(true);
        };
        let previous = self.backend.query_shelved_changes(latest).await?;
        let current = changes.to_vec();

        // Hashing reads every still-present file
        tokio::task::spawn_blocking(move || compare::has_material_changes(&current, &previous))
            .await
            .map_err(|e| ShelveError::Internal(format!("change comparison failed: {}", e)))?
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.schedule().take() {
            handle.abort();
        }
    }
}

/// Arm the periodic schedule. The first tick fires one period from now.
fn spawn_schedule(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let engine = AutoShelve { inner };
            // Dispatch only; the tick never waits for the run
            tokio::spawn(async move {
                engine.create_shelveset(false).await;
            });
        }
    })
}

/// Periodic, change-aware shelving of local workspaces.
///
/// Cloning is cheap and every clone drives the same engine. The schedule is
/// disarmed when the last clone is dropped.
#[derive(Clone)]
pub struct AutoShelve {
    inner: Arc<Inner>,
}

impl AutoShelve {
    /// Create a stopped engine.
    pub fn new(
        backend: Arc<dyn VersionControl>,
        host: Arc<dyn HostContext>,
        config: EngineConfig,
    ) -> ShelveResult<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                connection: ConnectionLifecycle::new(host),
                settings: RwLock::new(config.sanitized()),
                running: AtomicBool::new(false),
                schedule: Mutex::new(None),
                events: EventBus::new(),
            }),
        })
    }

    /// Arm the schedule and emit [`ShelveEvent::Started`].
    ///
    /// Starting a running engine re-arms the schedule. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) {
        let period = self.inner.period();
        {
            let mut schedule = self.inner.schedule();
            let handle = spawn_schedule(Arc::downgrade(&self.inner), period);
            if let Some(previous) = schedule.replace(handle) {
                previous.abort();
            }
            self.inner.running.store(true, Ordering::SeqCst);
        }

        info!("Auto shelve started, interval {:?}", period);
        self.inner.events.publish(ShelveEvent::Started);
    }

    /// Disarm the schedule and emit [`ShelveEvent::Stopped`].
    ///
    /// No-op when already stopped. Attempts in flight still complete; each
    /// holds its own copy of the connection URI.
    pub fn stop(&self) {
        let was_running = {
            let mut schedule = self.inner.schedule();
            if let Some(handle) = schedule.take() {
                handle.abort();
            }
            self.inner.running.swap(false, Ordering::SeqCst)
        };
        self.inner.connection.invalidate();
        if !was_running {
            return;
        }

        info!("Auto shelve stopped");
        self.inner.events.publish(ShelveEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run one shelve attempt per qualifying workspace.
    ///
    /// Returns once the attempts are spawned; await [`ShelveRun::join`] to
    /// collect their results. `force` skips the comparison against the last
    /// shelveset, but an empty workspace is never shelved.
    pub async fn create_shelveset(&self, force: bool) -> ShelveRun {
        let inner = &self.inner;

        let uri = match inner.connection.resolve(inner.backend.as_ref()).await {
            Ok(uri) => uri,
            Err(e) => {
                warn!("Could not connect to version control: {}", e);
                self.stop();
                inner.connection.invalidate();
                inner
                    .events
                    .publish(ShelveEvent::ConnectionError(Arc::new(e)));
                return ShelveRun::default();
            }
        };

        let settings = inner.run_settings();

        let workspaces = match inner.backend.list_local_workspaces(&uri).await {
            Ok(workspaces) => workspaces,
            Err(e) => {
                warn!("Could not list local workspaces: {}", e);
                inner.connection.invalidate();
                inner
                    .events
                    .publish(ShelveEvent::ShelvesetError(Arc::new(e)));
                return ShelveRun::default();
            }
        };

        let tasks: Vec<JoinHandle<ShelvesetResult>> = workspaces
            .into_iter()
            .filter(|ws| !ws.mapped_paths.is_empty() && ws.server_uri == uri)
            .map(|ws| {
                let inner = Arc::clone(inner);
                let settings = settings.clone();
                tokio::spawn(inner.shelve_workspace(ws, settings, force))
            })
            .collect();

        debug!("Spawned {} shelve attempts (force: {})", tasks.len(), force);

        // The connection is only cached while the schedule is armed
        if !self.is_running() {
            inner.connection.invalidate();
        }
        ShelveRun { tasks }
    }

    /// Retention in effect; 0 unless the name pattern is timestamped.
    pub fn maximum_shelvesets(&self) -> u16 {
        self.inner.settings().effective_maximum()
    }

    pub fn set_maximum_shelvesets(&self, maximum: u16) {
        self.inner.update(|s| s.maximum_shelvesets = maximum);
    }

    /// Current shelveset name pattern.
    pub fn shelveset_name(&self) -> String {
        self.inner.settings().name_pattern
    }

    /// Set the name pattern. The pattern is sanitized; an invalid placeholder
    /// surfaces as a failed attempt.
    pub fn set_shelveset_name(&self, pattern: &str) {
        let pattern = name::sanitize_pattern(pattern);
        self.inner.update(|s| s.name_pattern = pattern);
    }

    /// Minutes between scheduled attempts.
    pub fn interval(&self) -> f64 {
        self.inner.settings().interval_minutes
    }

    /// Change the interval, re-arming the schedule if it is running.
    pub fn set_interval(&self, minutes: f64) -> ShelveResult<()> {
        let period = interval_duration(minutes)?;
        self.inner.update(|s| s.interval_minutes = minutes);

        let mut schedule = self.inner.schedule();
        if self.is_running() {
            let handle = spawn_schedule(Arc::downgrade(&self.inner), period);
            if let Some(previous) = schedule.replace(handle) {
                previous.abort();
            }
            debug!("Schedule re-armed, interval {:?}", period);
        }
        Ok(())
    }

    pub fn pause_on_debug(&self) -> bool {
        self.inner.settings().pause_on_debug
    }

    pub fn set_pause_on_debug(&self, pause: bool) {
        self.inner.update(|s| s.pause_on_debug = pause);
    }

    /// Current options, with the configured (not effective) maximum.
    pub fn config(&self) -> EngineConfig {
        self.inner.settings()
    }

    /// Apply a full set of options. Invalid options change nothing.
    pub fn apply(&self, config: &EngineConfig) -> ShelveResult<()> {
        config.validate()?;
        self.set_shelveset_name(&config.name_pattern);
        self.set_maximum_shelvesets(config.maximum_shelvesets);
        self.set_pause_on_debug(config.pause_on_debug);
        if config.interval_minutes != self.interval() {
            self.set_interval(config.interval_minutes)?;
        }
        Ok(())
    }

    /// Subscribe to engine notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ShelveEvent> {
        self.inner.events.subscribe()
    }

    /// The cached backend connection, if one is resolved.
    pub fn connection(&self) -> Option<Url> {
        self.inner.connection.cached()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, StaticContext};
    use chrono::{Duration as ChronoDuration, Utc};
    use tokio::sync::broadcast::error::TryRecvError;

    const SERVER: &str = "https://tfs.example.com/DefaultCollection";
    const OWNER: &str = "CORP\\jdoe";

    fn server() -> Url {
        Url::parse(SERVER).unwrap()
    }

    fn workspace(name: &str) -> WorkspaceHandle {
        WorkspaceHandle::new(name, OWNER, server(), vec![format!("/src/{}", name).into()])
    }

    fn changes(count: usize) -> Vec<PendingChange> {
        (0..count)
            .map(|i| {
                PendingChange::edit(format!("$/ws/f{}.rs", i), format!("/nonexistent/f{}.rs", i))
                    .with_hash(vec![i as u8; 4])
            })
            .collect()
    }

    fn past(name: &str, age_hours: i64, comment: &str) -> Shelveset {
        Shelveset {
            name: name.to_string(),
            owner: OWNER.to_string(),
            creation_date: Utc::now() - ChronoDuration::hours(age_hours),
            comment: comment.to_string(),
        }
    }

    fn setup(config: EngineConfig) -> (Arc<MemoryBackend>, AutoShelve) {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_workspace(workspace("ws")).unwrap();
        let engine = AutoShelve::new(
            backend.clone(),
            Arc::new(StaticContext::new(SERVER)),
            config,
        )
        .unwrap();
        (backend, engine)
    }

    fn drain(rx: &mut broadcast::Receiver<ShelveEvent>) -> Vec<ShelveEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    #[tokio::test]
    async fn test_first_run_creates_shelveset() {
        let (backend, engine) = setup(EngineConfig::default());
        backend.set_pending_changes("ws", changes(3)).unwrap();
        let mut rx = engine.subscribe();

        let results = engine.create_shelveset(false).await.join().await;

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert!(result.created());
        assert_eq!(result.shelveset_name, "Auto Shelve ws");
        assert_eq!(result.change_count, 3);
        assert_eq!(result.purge_count, 0);

        let stored = backend.shelvesets().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].comment, "Shelved by Auto Shelve. 3 items");
        // Not cached for a stopped engine
        assert!(engine.connection().is_none());

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [ShelveEvent::ShelvesetCreated(r)] if r.change_count == 3
        ));
    }

    #[tokio::test]
    async fn test_unchanged_workspace_is_not_shelved() {
        let (backend, engine) = setup(EngineConfig::default());
        backend
            .insert_shelveset(
                past("Auto Shelve ws", 1, &Shelveset::engine_comment(3)),
                changes(3),
            )
            .unwrap();
        backend.set_pending_changes("ws", changes(3)).unwrap();

        let results = engine.create_shelveset(false).await.join().await;

        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
        assert!(!results[0].created());
        assert_eq!(results[0].change_count, 0);
        assert_eq!(results[0].shelveset_name, "Auto Shelve ws");
        assert_eq!(backend.shelvesets().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_without_edits_is_noop() {
        let (backend, engine) = setup(EngineConfig::default());
        backend.set_pending_changes("ws", changes(2)).unwrap();

        let first = engine.create_shelveset(false).await.join().await;
        assert_eq!(first[0].change_count, 2);

        let second = engine.create_shelveset(false).await.join().await;
        assert_eq!(second[0].change_count, 0);
        assert_eq!(backend.shelvesets().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retention_purges_oldest() {
        let config = EngineConfig {
            name_pattern: "Auto Shelve {0} {2}".to_string(),
            maximum_shelvesets: 2,
            ..Default::default()
        };
        let (backend, engine) = setup(config);
        let comment = Shelveset::engine_comment(3);
        for age in 1..=3 {
            backend
                .insert_shelveset(past(&format!("Auto Shelve ws old{}", age), age, &comment), changes(3))
                .unwrap();
        }
        backend.set_pending_changes("ws", changes(4)).unwrap();

        let results = engine.create_shelveset(false).await.join().await;

        assert_eq!(results[0].change_count, 4);
        assert_eq!(results[0].purge_count, 1);

        let names: Vec<String> = backend
            .shelvesets()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names.len(), 3);
        assert!(!names.contains(&"Auto Shelve ws old3".to_string()));
        assert!(names.contains(&"Auto Shelve ws old1".to_string()));
    }

    #[tokio::test]
    async fn test_retention_ignores_foreign_shelvesets() {
        let config = EngineConfig {
            name_pattern: "Auto {0} {2}".to_string(),
            maximum_shelvesets: 1,
            ..Default::default()
        };
        let (backend, engine) = setup(config);
        backend
            .insert_shelveset(past("my ws work", 5, "hand made"), changes(1))
            .unwrap();
        backend
            .insert_shelveset(past("Auto other 1", 4, &Shelveset::engine_comment(1)), changes(1))
            .unwrap();
        backend.set_pending_changes("ws", changes(2)).unwrap();

        let results = engine.create_shelveset(false).await.join().await;

        assert_eq!(results[0].change_count, 2);
        assert_eq!(results[0].purge_count, 0);
        assert_eq!(backend.shelvesets().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_connection_failure_stops_engine() {
        let backend = Arc::new(MemoryBackend::new());
        backend.add_workspace(workspace("ws")).unwrap();
        backend.set_pending_changes("ws", changes(3)).unwrap();
        backend.reject_connections(true);
        let engine = AutoShelve::new(
            backend.clone(),
            Arc::new(StaticContext::new(SERVER)),
            EngineConfig::default(),
        )
        .unwrap();
        let mut rx = engine.subscribe();

        engine.start();
        let run = engine.create_shelveset(false).await;

        assert!(run.is_empty());
        assert!(!engine.is_running());
        assert!(engine.connection().is_none());
        assert!(backend.shelvesets().unwrap().is_empty());

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [
                ShelveEvent::Started,
                ShelveEvent::Stopped,
                ShelveEvent::ConnectionError(_)
            ]
        ));
    }

    #[tokio::test]
    async fn test_connection_cached_only_while_running() {
        let (backend, engine) = setup(EngineConfig::default());
        backend.set_pending_changes("ws", changes(1)).unwrap();

        engine.start();
        engine.create_shelveset(false).await.join().await;
        assert_eq!(engine.connection(), Some(server()));

        engine.create_shelveset(false).await.join().await;
        assert_eq!(backend.connect_count(), 1);

        engine.stop();
        assert!(engine.connection().is_none());

        engine.create_shelveset(true).await.join().await;
        assert!(engine.connection().is_none());
        assert_eq!(backend.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_runs_both_report() {
        // Known race: runs for one workspace are not serialized
        let (backend, engine) = setup(EngineConfig::default());
        backend.set_pending_changes("ws", changes(2)).unwrap();
        backend.delay_pending_changes(Duration::from_millis(200));
        let mut rx = engine.subscribe();

        let first = engine.create_shelveset(false).await;
        let second = engine.create_shelveset(false).await;
        let results: Vec<ShelvesetResult> = first
            .join()
            .await
            .into_iter()
            .chain(second.join().await)
            .collect();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_success()));
        assert!(results.iter().any(|r| r.change_count == 2));
        // Both attempts may create; a later one replaces an earlier one by name
        assert_eq!(backend.shelvesets().unwrap().len(), 1);

        let created = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ShelveEvent::ShelvesetCreated(_)))
            .count();
        assert_eq!(created, 2);
    }

    #[tokio::test]
    async fn test_stop_does_not_cancel_in_flight_attempt() {
        let (backend, engine) = setup(EngineConfig::default());
        backend.set_pending_changes("ws", changes(2)).unwrap();
        backend.delay_pending_changes(Duration::from_millis(200));
        engine.start();
        let mut rx = engine.subscribe();

        let run = engine.create_shelveset(false).await;
        engine.stop();
        let results = run.join().await;

        assert_eq!(results[0].change_count, 2);
        assert_eq!(backend.shelvesets().unwrap().len(), 1);
        assert!(engine.connection().is_none());

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [ShelveEvent::Stopped, ShelveEvent::ShelvesetCreated(r)] if r.change_count == 2
        ));
    }

    #[tokio::test]
    async fn test_missing_project_context_is_connection_error() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = AutoShelve::new(
            backend,
            Arc::new(StaticContext::none()),
            EngineConfig::default(),
        )
        .unwrap();
        let mut rx = engine.subscribe();

        assert!(engine.create_shelveset(true).await.is_empty());

        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [ShelveEvent::ConnectionError(e)] if e.is_connection()));
    }

    #[tokio::test]
    async fn test_listing_failure_keeps_schedule() {
        let (backend, engine) = setup(EngineConfig::default());
        backend.fail_listing(true);
        engine.start();
        let mut rx = engine.subscribe();

        assert!(engine.create_shelveset(false).await.is_empty());

        assert!(engine.is_running());
        assert!(engine.connection().is_none());
        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [ShelveEvent::ShelvesetError(_)]));
        engine.stop();
    }

    #[tokio::test]
    async fn test_attempt_failure_is_reported_in_result() {
        let (backend, engine) = setup(EngineConfig::default());
        backend.fail_pending_changes(true);

        let results = engine.create_shelveset(false).await.join().await;

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert!(!result.is_success());
        assert_eq!(result.shelveset_name, "Auto Shelve ws");
        assert_eq!(result.change_count, 0);
        assert!(engine.connection().is_none());
    }

    #[tokio::test]
    async fn test_invalid_pattern_fails_attempt() {
        let (backend, engine) = setup(EngineConfig::default());
        backend.set_pending_changes("ws", changes(1)).unwrap();
        engine.set_shelveset_name("Auto {7}");

        let results = engine.create_shelveset(false).await.join().await;

        assert!(matches!(
            results[0].error.as_deref(),
            Some(ShelveError::InvalidPattern(_))
        ));
        assert!(results[0].shelveset_name.is_empty());
    }

    #[tokio::test]
    async fn test_workspaces_are_filtered() {
        let (backend, engine) = setup(EngineConfig::default());
        backend
            .add_workspace(WorkspaceHandle::new("unmapped", OWNER, server(), Vec::new()))
            .unwrap();
        backend
            .add_workspace(WorkspaceHandle::new(
                "elsewhere",
                OWNER,
                Url::parse("https://other.example.com/tfs").unwrap(),
                vec!["/src/elsewhere".into()],
            ))
            .unwrap();
        backend.add_workspace(workspace("second")).unwrap();

        let results = engine.create_shelveset(false).await.join().await;

        let mut names: Vec<String> = results.into_iter().map(|r| r.shelveset_name).collect();
        names.sort();
        assert_eq!(names, vec!["Auto Shelve second", "Auto Shelve ws"]);
    }

    #[tokio::test]
    async fn test_force_skips_comparison() {
        let (backend, engine) = setup(EngineConfig::default());
        backend
            .insert_shelveset(
                past("Auto Shelve ws", 1, &Shelveset::engine_comment(3)),
                changes(3),
            )
            .unwrap();
        backend.set_pending_changes("ws", changes(3)).unwrap();

        let results = engine.create_shelveset(true).await.join().await;

        assert_eq!(results[0].change_count, 3);
        // Replaced in place
        assert_eq!(backend.shelvesets().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_force_with_no_pending_changes() {
        let (backend, engine) = setup(EngineConfig::default());

        let results = engine.create_shelveset(true).await.join().await;

        assert!(results[0].is_success());
        assert_eq!(results[0].change_count, 0);
        assert!(backend.shelvesets().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_maximum_requires_timestamped_pattern() {
        let (_backend, engine) = setup(EngineConfig::default());

        engine.set_maximum_shelvesets(5);
        assert_eq!(engine.maximum_shelvesets(), 0);
        assert_eq!(engine.config().maximum_shelvesets, 5);

        engine.set_shelveset_name("Auto {0} {2}");
        assert_eq!(engine.maximum_shelvesets(), 5);
    }

    #[tokio::test]
    async fn test_start_stop_events() {
        let (_backend, engine) = setup(EngineConfig::default());
        let mut rx = engine.subscribe();
        assert!(!engine.is_running());

        engine.start();
        assert!(engine.is_running());
        engine.stop();
        assert!(!engine.is_running());
        engine.stop();

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [ShelveEvent::Started, ShelveEvent::Stopped]
        ));
    }

    #[tokio::test]
    async fn test_interval_validation() {
        let (_backend, engine) = setup(EngineConfig::default());

        assert!(engine.set_interval(0.0).is_err());
        assert!(engine.set_interval(-3.0).is_err());
        assert_eq!(engine.interval(), 5.0);

        engine.set_interval(2.5).unwrap();
        assert_eq!(engine.interval(), 2.5);
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = EngineConfig {
            interval_minutes: 0.0,
            ..Default::default()
        };
        let result = AutoShelve::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(StaticContext::new(SERVER)),
            config,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_apply_options() {
        let (_backend, engine) = setup(EngineConfig::default());
        let options = EngineConfig {
            name_pattern: "Nightly {0} {2}".to_string(),
            maximum_shelvesets: 3,
            interval_minutes: 10.0,
            pause_on_debug: true,
        };

        engine.apply(&options).unwrap();
        assert_eq!(engine.config(), options);

        let invalid = EngineConfig {
            interval_minutes: -1.0,
            ..Default::default()
        };
        assert!(engine.apply(&invalid).is_err());
        assert_eq!(engine.config(), options);
    }

    #[tokio::test]
    async fn test_schedule_fires_after_interval() {
        let (backend, engine) = setup(EngineConfig::default());
        backend.set_pending_changes("ws", changes(2)).unwrap();
        let mut rx = engine.subscribe();

        // 60ms
        engine.set_interval(0.001).unwrap();
        engine.start();

        let created = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ShelveEvent::ShelvesetCreated(result)) = rx.recv().await {
                    return result;
                }
            }
        })
        .await
        .unwrap();

        engine.stop();
        assert_eq!(created.change_count, 2);
    }
}
