//! Schedule controller: decides which date is processed and when.
//!
//! Scheduled fires target the day before the fire time. Fires that passed while the
//! process was down are either executed immediately (within the grace window) or recorded
//! as permanently missed. Backfill bypasses the date computation entirely.
//!
//! Every invocation takes an in-process async lock and then an advisory lock file, so a
//! trigger that arrives during an active run waits for it rather than overlapping, even
//! when the daemon and an operator command are separate processes. Schedule state is
//! re-read and merged under that lock before each write, so no process erases what
//! another one recorded.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, ScheduleConfig};
use crate::error::SchedulerError;
use crate::fetch::HttpUpstream;
use crate::lock::RunLock;
use crate::persistence;
use crate::pipeline::{PipelineRun, RunTrigger};
use crate::storage::LocalObjectStore;
use crate::transform::SystemClock;
use crate::types::{RunSummary, TargetDate};

/// Upper bound on past fire times inspected on one startup.
const MAX_CATCHUP_FIRES: usize = 1_000;

/// Parse a cron expression string into a Schedule.
pub fn parse_cron_expression(expr: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(expr).map_err(|e| SchedulerError::InvalidCronExpression {
        expression: expr.to_string(),
        message: e.to_string(),
    })
}

/// What to do about a fire time that has already passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissedRunAction {
    ExecuteNow { target_date: TargetDate },
    Skip { target_date: TargetDate },
}

/// Classify a passed fire time against the grace window. Pure.
pub fn classify_missed(
    fire_time: DateTime<Utc>,
    now: DateTime<Utc>,
    grace_window: Duration,
) -> MissedRunAction {
    let target_date = TargetDate::yesterday_of(fire_time);
    if now - fire_time <= grace_window {
        MissedRunAction::ExecuteNow { target_date }
    } else {
        MissedRunAction::Skip { target_date }
    }
}

/// A fire that was detected too late and will never run on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissedRun {
    pub fire_time: DateTime<Utc>,
    pub target_date: TargetDate,
    pub detected_at: DateTime<Utc>,
    pub late_by_secs: i64,
}

/// Controller state that survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fire_handled: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_date: Option<TargetDate>,
    #[serde(default)]
    pub missed: Vec<MissedRun>,
}

impl ScheduleState {
    /// Fold in state written by another process. Every field only moves forward, so the
    /// merge never loses a handled fire or a recorded miss.
    pub fn merge(&mut self, other: ScheduleState) {
        self.last_fire_handled = self.last_fire_handled.max(other.last_fire_handled);
        self.last_completed_date = self.last_completed_date.max(other.last_completed_date);
        for missed in other.missed {
            if !self.missed.iter().any(|m| m.fire_time == missed.fire_time) {
                self.missed.push(missed);
            }
        }
        self.missed.sort_by_key(|m| m.fire_time);
    }
}

/// Save schedule state to `path`.
pub fn save_state(state: &ScheduleState, path: &Path) -> Result<(), SchedulerError> {
    persistence::atomic_write_json(path, state).map_err(|e| SchedulerError::PersistenceError {
        message: format!("Failed to write schedule state {}: {}", path.display(), e),
    })
}

/// Load schedule state, starting fresh when the file is absent or unreadable.
pub fn load_state(path: &Path) -> ScheduleState {
    match persistence::load_json::<ScheduleState>(path) {
        Ok(Some(state)) => {
            debug!(
                path = %path.display(),
                missed = state.missed.len(),
                "Loaded schedule state"
            );
            state
        }
        Ok(None) => ScheduleState::default(),
        Err(e) => {
            warn!("Failed to read schedule state: {}, starting fresh", e);
            ScheduleState::default()
        }
    }
}

/// Result of startup missed-fire resolution.
#[derive(Debug, Default)]
pub struct MissedRunReport {
    pub executed: Vec<RunSummary>,
    pub skipped: Vec<MissedRun>,
}

/// Exclusive right to run the pipeline and write schedule state.
struct RunSlot<'a> {
    _task: MutexGuard<'a, ()>,
    _file: Option<RunLock>,
}

pub struct ScheduleController {
    trigger: Arc<dyn RunTrigger>,
    schedule: Schedule,
    expression: String,
    grace_window: Duration,
    state_path: Option<PathBuf>,
    lock_path: Option<PathBuf>,
    state: Mutex<ScheduleState>,
    run_lock: Mutex<()>,
}

impl ScheduleController {
    /// The lock file defaults to the state path with a `.lock` extension.
    pub fn new(
        trigger: Arc<dyn RunTrigger>,
        config: &ScheduleConfig,
    ) -> Result<Self, SchedulerError> {
        let schedule = parse_cron_expression(&config.cron)?;
        let state = config
            .state_path
            .as_deref()
            .map(load_state)
            .unwrap_or_default();
        Ok(Self {
            trigger,
            schedule,
            expression: config.cron.clone(),
            grace_window: config.grace_window(),
            state_path: config.state_path.clone(),
            lock_path: config
                .state_path
                .as_ref()
                .map(|p| p.with_extension("lock")),
            state: Mutex::new(state),
            run_lock: Mutex::new(()),
        })
    }

    /// Validate `config` and wire the production collaborators: HTTP upstream, local
    /// object store, wall clock. Without a state path the lock file sits next to the
    /// storage root.
    pub fn from_config(config: &PipelineConfig) -> crate::error::Result<Self> {
        config.validate()?;
        let upstream = HttpUpstream::new(&config.upstream)?;
        let store = LocalObjectStore::new(&config.storage.root);
        let run = PipelineRun::from_config(
            config,
            Arc::new(upstream),
            Arc::new(store),
            Arc::new(SystemClock),
        )?;
        let controller = Self::new(Arc::new(run), &config.schedule)?;
        Ok(match config.schedule.state_path {
            Some(_) => controller,
            None => controller.with_lock_path(config.storage.root.with_extension("lock")),
        })
    }

    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    pub fn lock_path(&self) -> Option<&Path> {
        self.lock_path.as_deref()
    }

    pub async fn state(&self) -> ScheduleState {
        self.state.lock().await.clone()
    }

    /// The first fire time strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        self.schedule
            .after(&after)
            .next()
            .ok_or_else(|| SchedulerError::NoUpcomingFire {
                expression: self.expression.clone(),
            })
    }

    /// Next fire for the run loop. Never at or before `last_fired`, even when the wall
    /// clock has been stepped back since.
    fn upcoming_fire(
        &self,
        now: DateTime<Utc>,
        last_fired: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        self.next_fire_after(last_fired.map_or(now, |last| last.max(now)))
    }

    /// The latest fire time at or before `at`.
    fn latest_fire_until(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&(at + Duration::seconds(1)))
            .rev()
            .find(|t| *t <= at)
    }

    /// Handle fire times that passed while the controller was not running.
    ///
    /// With recorded history, every fire since the last handled one is classified. Without
    /// history only the most recent passed fire is, so a fresh install does not report
    /// days it was never expected to cover.
    pub async fn resolve_missed(&self, now: DateTime<Utc>) -> MissedRunReport {
        let last = {
            let _slot = self.acquire_slot().await;
            self.state.lock().await.last_fire_handled
        };
        let due: Vec<DateTime<Utc>> = match last {
            Some(last) => {
                let fires: Vec<_> = self
                    .schedule
                    .after(&last)
                    .take_while(|t| *t <= now)
                    .take(MAX_CATCHUP_FIRES)
                    .collect();
                if fires.len() == MAX_CATCHUP_FIRES {
                    warn!(
                        limit = MAX_CATCHUP_FIRES,
                        "Too many passed fire times; only the oldest are inspected"
                    );
                }
                fires
            }
            None => self.latest_fire_until(now).into_iter().collect(),
        };

        let mut report = MissedRunReport::default();
        for fire_time in due {
            match classify_missed(fire_time, now, self.grace_window) {
                MissedRunAction::ExecuteNow { target_date } => {
                    info!(
                        fire_time = %fire_time,
                        target_date = %target_date,
                        late_by_secs = (now - fire_time).num_seconds(),
                        "Missed fire within grace window, running now"
                    );
                    report.executed.push(self.trigger_scheduled(fire_time).await);
                }
                MissedRunAction::Skip { target_date } => {
                    let missed = MissedRun {
                        fire_time,
                        target_date,
                        detected_at: now,
                        late_by_secs: (now - fire_time).num_seconds(),
                    };
                    warn!(
                        fire_time = %fire_time,
                        target_date = %target_date,
                        late_by_secs = missed.late_by_secs,
                        grace_window_secs = self.grace_window.num_seconds(),
                        "Missed fire beyond grace window, recorded as permanently missed"
                    );
                    let _slot = self.acquire_slot().await;
                    self.commit(|state| {
                        state.merge(ScheduleState {
                            last_fire_handled: Some(fire_time),
                            last_completed_date: None,
                            missed: vec![missed.clone()],
                        })
                    })
                    .await;
                    report.skipped.push(missed);
                }
            }
        }
        report
    }

    /// Run the pipeline for the day before `fire_time`.
    pub async fn trigger_scheduled(&self, fire_time: DateTime<Utc>) -> RunSummary {
        self.invoke(TargetDate::yesterday_of(fire_time), "scheduled", Some(fire_time))
            .await
    }

    /// Operator-requested run for the most recently completed day relative to `now`.
    pub async fn run_now(&self, now: DateTime<Utc>) -> RunSummary {
        self.invoke(TargetDate::yesterday_of(now), "manual", None).await
    }

    /// Operator-requested (re)processing of an explicit date.
    pub async fn backfill(&self, date: TargetDate) -> RunSummary {
        self.invoke(date, "backfill", None).await
    }

    /// Backfill every date in `from..=to`, oldest first.
    pub async fn backfill_range(
        &self,
        from: TargetDate,
        to: TargetDate,
    ) -> Result<Vec<RunSummary>, SchedulerError> {
        if from > to {
            return Err(SchedulerError::InvalidRange {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let mut summaries = Vec::new();
        let mut date = Some(from);
        while let Some(current) = date.filter(|d| *d <= to) {
            summaries.push(self.backfill(current).await);
            date = current.succ();
        }
        Ok(summaries)
    }

    /// Resolve missed fires, then trigger on every fire time until `shutdown` completes.
    ///
    /// Shutdown abandons an in-flight run; no summary is produced for it.
    pub async fn run_until_shutdown<F>(&self, shutdown: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested during startup");
                return Ok(());
            }
            _ = self.resolve_missed(Utc::now()) => {}
        }

        let mut last_fired = self.state.lock().await.last_fire_handled;
        loop {
            let now = Utc::now();
            let next = self.upcoming_fire(now, last_fired)?;
            let wait = (next - now).to_std().unwrap_or_default();
            info!(
                next_fire = %next,
                target_date = %TargetDate::yesterday_of(next),
                wait_secs = wait.as_secs(),
                "Waiting for next scheduled fire"
            );

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, scheduler stopping");
                    return Ok(());
                }
                _ = async {
                    tokio::time::sleep(wait).await;
                    self.trigger_scheduled(next).await
                } => {
                    last_fired = Some(next);
                }
            }
        }
    }

    async fn invoke(
        &self,
        target_date: TargetDate,
        reason: &'static str,
        fire_time: Option<DateTime<Utc>>,
    ) -> RunSummary {
        let _slot = self.acquire_slot().await;
        info!(target_date = %target_date, trigger = reason, "Invoking pipeline run");
        let summary = self.trigger.run(target_date).await;
        let completed = (summary.successes > 0).then_some(target_date);
        self.commit(|state| {
            state.merge(ScheduleState {
                last_fire_handled: fire_time,
                last_completed_date: completed,
                missed: Vec::new(),
            })
        })
        .await;
        summary
    }

    /// Take the in-process lock, then the lock file, then pick up state other
    /// processes saved since we last looked.
    async fn acquire_slot(&self) -> RunSlot<'_> {
        let task = self.run_lock.lock().await;
        let file = match &self.lock_path {
            Some(path) => match RunLock::acquire(path).await {
                Ok(lock) => Some(lock),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        "Failed to take run lock: {}, continuing without it", e
                    );
                    None
                }
            },
            None => None,
        };
        if let Some(path) = &self.state_path {
            let on_disk = load_state(path);
            self.state.lock().await.merge(on_disk);
        }
        RunSlot {
            _task: task,
            _file: file,
        }
    }

    /// Apply `update` and save. Callers hold a [`RunSlot`].
    async fn commit(&self, update: impl FnOnce(&mut ScheduleState)) {
        let snapshot = {
            let mut state = self.state.lock().await;
            update(&mut state);
            state.clone()
        };
        let Some(path) = &self.state_path else {
            return;
        };
        match save_state(&snapshot, path) {
            Ok(()) => debug!(path = %path.display(), "Schedule state saved"),
            Err(e) => warn!("{}", e),
        }
    }
}
