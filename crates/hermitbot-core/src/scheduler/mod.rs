//! Task scheduler.
//!
//! One scheduler instance drives both built-in periodic actions
//! (registered by tag) and dynamic jobs added at runtime (keyed by opaque
//! id). Schedules come in three shapes: cron expressions (5-field accepted,
//! a seconds field is prepended), `@every` descriptors, and bare durations
//! (`Ns|Nms|Nm|Nh`).
//!
//! Every invocation runs on a child token of the scheduler token and under
//! a 5-minute timeout. One-shot tasks remove themselves after their first
//! execution completes. `stop()` cancels the driver and blocks until
//! in-flight invocations finish.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{DomainError, Sentinel};

/// Wall-clock budget per task invocation.
const TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Longest the driver sleeps between schedule recomputations.
const MAX_DRIVER_SLEEP: Duration = Duration::from_secs(30);

/// When a task fires.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Cron expression occurrence times.
    Cron(Box<cron::Schedule>),
    /// Fixed interval, first firing one interval from now.
    Every(Duration),
    /// One absolute instant.
    At(DateTime<Utc>),
}

impl Schedule {
    /// Parse a schedule string: `@every <dur>`, a bare duration, or a cron
    /// expression.
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let input = input.trim();
        if let Some(rest) = input.strip_prefix("@every") {
            return parse_duration(rest.trim()).map(Schedule::Every);
        }
        if let Ok(duration) = parse_duration(input) {
            return Ok(Schedule::Every(duration));
        }

        // The cron crate wants a seconds field; accept the common 5-field
        // form by prepending one.
        let expr = if input.split_whitespace().count() == 5 {
            format!("0 {input}")
        } else {
            input.to_string()
        };
        cron::Schedule::from_str(&expr)
            .map(|s| Schedule::Cron(Box::new(s)))
            .map_err(|e| {
                DomainError::with_source("Scheduler.ParseSchedule", Sentinel::InvalidInput, e)
            })
    }

    /// The next firing strictly after `now`, if any.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => schedule.after(&now).next(),
            Schedule::Every(interval) => {
                Some(now + chrono::Duration::from_std(*interval).ok()?)
            }
            Schedule::At(at) => (*at > now).then_some(*at),
        }
    }
}

/// `Ns|Nms|Nm|Nh`; must be positive.
fn parse_duration(input: &str) -> Result<Duration, DomainError> {
    let err = || DomainError::new("Scheduler.ParseSchedule", Sentinel::InvalidInput);
    let (digits, unit) = match input.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => input.split_at(pos),
        None => return Err(err()),
    };
    let value: u64 = digits.parse().map_err(|_| err())?;
    if value == 0 {
        return Err(err());
    }
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(err()),
    }
}

/// Task callback. Receives a child token cancelled when the scheduler
/// stops.
pub type TaskFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// A statically registered task referencing an action by tag.
pub struct SchedulerTask {
    pub action: String,
    pub schedule: Schedule,
    pub one_shot: bool,
}

struct TaskEntry {
    schedule: Schedule,
    func: TaskFn,
    one_shot: bool,
    next_run: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct SchedulerState {
    actions: HashMap<String, TaskFn>,
    tasks: HashMap<String, TaskEntry>,
    cancel: Option<CancellationToken>,
}

pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
    tracker: TaskTracker,
    wake: Arc<tokio::sync::Notify>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::default())),
            tracker: TaskTracker::new(),
            wake: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Register a named action for later [`Scheduler::add_task`] calls.
    pub fn register_action<F, Fut>(&self, tag: &str, func: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let boxed: TaskFn = Arc::new(move |token| Box::pin(func(token)));
        self.state
            .lock()
            .unwrap()
            .actions
            .insert(tag.to_string(), boxed);
    }

    /// Schedule a registered action. The action tag doubles as the task id.
    pub fn add_task(&self, task: SchedulerTask) -> Result<(), DomainError> {
        let func = {
            let state = self.state.lock().unwrap();
            state
                .actions
                .get(&task.action)
                .cloned()
                .ok_or_else(|| DomainError::new("Scheduler.AddTask", Sentinel::NotFound))?
        };
        self.insert_entry(&task.action, task.schedule, func, task.one_shot)
    }

    /// Schedule a dynamic task under an opaque id. Duplicate ids error.
    pub fn add_dynamic_task<F, Fut>(
        &self,
        id: &str,
        schedule: Schedule,
        func: F,
        one_shot: bool,
    ) -> Result<(), DomainError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let boxed: TaskFn = Arc::new(move |token| Box::pin(func(token)));
        self.insert_entry(id, schedule, boxed, one_shot)
    }

    fn insert_entry(
        &self,
        id: &str,
        schedule: Schedule,
        func: TaskFn,
        one_shot: bool,
    ) -> Result<(), DomainError> {
        let next_run = schedule.next_after(Utc::now());
        let mut state = self.state.lock().unwrap();
        if state.tasks.contains_key(id) {
            return Err(DomainError::new("Scheduler.AddTask", Sentinel::Duplicate));
        }
        debug!(id, one_shot, next_run = ?next_run, "Scheduled task");
        state.tasks.insert(
            id.to_string(),
            TaskEntry {
                schedule,
                func,
                one_shot,
                next_run,
            },
        );
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    /// Remove a task. Returns whether it existed.
    pub fn remove_dynamic_task(&self, id: &str) -> bool {
        let removed = self.state.lock().unwrap().tasks.remove(id).is_some();
        if removed {
            self.wake.notify_one();
        }
        removed
    }

    pub fn get_next_run(&self, id: &str) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().tasks.get(id).and_then(|t| t.next_run)
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }

    /// Start the driver loop. Calling start on a running scheduler is a
    /// no-op.
    pub fn start(&self) {
        let cancel = {
            let mut state = self.state.lock().unwrap();
            if state.cancel.is_some() {
                return;
            }
            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());
            cancel
        };
        info!("Scheduler started");

        let state = Arc::clone(&self.state);
        let tracker = self.tracker.clone();
        let wake = Arc::clone(&self.wake);
        self.tracker.spawn(async move {
            loop {
                let now = Utc::now();
                let mut due: Vec<(String, TaskFn, bool)> = Vec::new();
                let mut earliest: Option<DateTime<Utc>> = None;
                {
                    let mut state = state.lock().unwrap();
                    for (id, entry) in state.tasks.iter_mut() {
                        match entry.next_run {
                            Some(at) if at <= now => {
                                due.push((id.clone(), Arc::clone(&entry.func), entry.one_shot));
                                entry.next_run = if entry.one_shot {
                                    None
                                } else {
                                    entry.schedule.next_after(now)
                                };
                            }
                            _ => {}
                        }
                        if let Some(at) = entry.next_run {
                            earliest = Some(earliest.map_or(at, |e: DateTime<Utc>| e.min(at)));
                        }
                    }
                }

                for (id, func, one_shot) in due {
                    let child = cancel.child_token();
                    let state = Arc::clone(&state);
                    tracker.spawn(async move {
                        debug!(id = %id, "Running scheduled task");
                        if tokio::time::timeout(TASK_TIMEOUT, (*func)(child)).await.is_err() {
                            warn!(id = %id, "Scheduled task timed out");
                        }
                        if one_shot {
                            state.lock().unwrap().tasks.remove(&id);
                        }
                    });
                }

                let sleep = earliest
                    .and_then(|at| (at - Utc::now()).to_std().ok())
                    .unwrap_or(MAX_DRIVER_SLEEP)
                    .min(MAX_DRIVER_SLEEP);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(sleep) => {}
                    _ = wake.notified() => {}
                }
            }
            info!("Scheduler driver stopped");
        });
    }

    /// Cancel the driver and wait until in-flight invocations finish.
    /// Idempotent.
    pub async fn stop(&self) {
        let cancel = self.state.lock().unwrap().cancel.take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}
