//! JSON file store for cron jobs and their run history.
//!
//! Two files in the cron data directory: `jobs.json` (array of jobs) and
//! `runs.json` (map of job id to run list, most recent 100 kept). All
//! writes go through a tmp-file-then-rename so a crash never leaves a
//! half-written store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

use crate::error::{DomainError, Sentinel};
use crate::scheduler::Schedule;

/// Most recent runs kept per job.
pub const MAX_RUNS_PER_JOB: usize = 100;

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CronSchedule {
    /// One-shot at an absolute instant.
    At { at: DateTime<Utc> },
    /// Recurring every `every_ms` milliseconds.
    Every { every_ms: u64 },
    /// Cron expression.
    Cron { expr: String },
}

impl CronSchedule {
    pub fn is_one_shot(&self) -> bool {
        matches!(self, CronSchedule::At { .. })
    }

    /// Convert into a scheduler [`Schedule`], validating as a side effect.
    pub fn to_schedule(&self) -> Result<Schedule, DomainError> {
        match self {
            CronSchedule::At { at } => Ok(Schedule::At(*at)),
            CronSchedule::Every { every_ms } => {
                if *every_ms == 0 {
                    return Err(DomainError::new(
                        "CronSchedule.Validate",
                        Sentinel::InvalidInput,
                    ));
                }
                Ok(Schedule::Every(Duration::from_millis(*every_ms)))
            }
            CronSchedule::Cron { expr } => Schedule::parse(expr),
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        self.to_schedule().map(|_| ())
    }
}

/// What a job does when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronAction {
    /// Drive an agent with a synthetic inbound message.
    AgentRun {
        agent_id: String,
        channel: String,
        message: String,
    },
}

impl CronAction {
    pub fn message(&self) -> &str {
        match self {
            CronAction::AgentRun { message, .. } => message,
        }
    }

    pub fn set_message(&mut self, new_message: &str) {
        match self {
            CronAction::AgentRun { message, .. } => *message = new_message.to_string(),
        }
    }
}

/// A scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub schedule: CronSchedule,
    pub action: CronAction,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
}

impl CronJob {
    pub fn new(name: &str, schedule: CronSchedule, action: CronAction) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new().to_string(),
            name: name.to_string(),
            schedule,
            action,
            enabled: true,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
        }
    }
}

/// One recorded execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronRun {
    pub id: String,
    pub job_id: String,
    pub at: DateTime<Utc>,
    pub duration_ms: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct StoreState {
    jobs: Vec<CronJob>,
    runs: HashMap<String, Vec<CronRun>>,
}

/// Persistent store backing the cron manager.
pub struct CronStore {
    dir: PathBuf,
    state: Mutex<StoreState>,
}

impl CronStore {
    pub fn new(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let state = Self::load(dir);
        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    fn load(dir: &Path) -> StoreState {
        let jobs = read_json(&dir.join("jobs.json")).unwrap_or_default();
        let runs = read_json(&dir.join("runs.json")).unwrap_or_default();
        StoreState { jobs, runs }
    }

    pub fn list(&self) -> Vec<CronJob> {
        self.state.lock().unwrap().jobs.clone()
    }

    pub fn get(&self, id: &str) -> Option<CronJob> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
    }

    /// Insert or replace a job, then persist.
    pub fn put(&self, job: CronJob) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        match state.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => state.jobs.push(job),
        }
        self.save_jobs(&state)
    }

    /// Remove a job and its run history, then persist. Returns whether the
    /// job existed.
    pub fn delete(&self, id: &str) -> Result<bool, DomainError> {
        let mut state = self.state.lock().unwrap();
        let before = state.jobs.len();
        state.jobs.retain(|j| j.id != id);
        let removed = state.jobs.len() < before;
        if removed {
            state.runs.remove(id);
            self.save_jobs(&state)?;
            self.save_runs(&state)?;
        }
        Ok(removed)
    }

    /// Append a run, discarding the oldest past the cap, then persist.
    pub fn record_run(&self, run: CronRun) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        let list = state.runs.entry(run.job_id.clone()).or_default();
        list.push(run);
        if list.len() > MAX_RUNS_PER_JOB {
            let excess = list.len() - MAX_RUNS_PER_JOB;
            list.drain(..excess);
        }
        self.save_runs(&state)
    }

    pub fn runs(&self, job_id: &str) -> Vec<CronRun> {
        self.state
            .lock()
            .unwrap()
            .runs
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    fn save_jobs(&self, state: &StoreState) -> Result<(), DomainError> {
        write_json(&self.dir.join("jobs.json"), &state.jobs)
            .map_err(|e| DomainError::with_source("CronStore.SaveJobs", Sentinel::Provider, e))
    }

    fn save_runs(&self, state: &StoreState) -> Result<(), DomainError> {
        write_json(&self.dir.join("runs.json"), &state.runs)
            .map_err(|e| DomainError::with_source("CronStore.SaveRuns", Sentinel::Provider, e))
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse cron store file");
            None
        }
    }
}

/// Write via `<name>.tmp` + rename so readers never see a torn file.
fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = tmp_path(path);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str) -> CronJob {
        CronJob::new(
            name,
            CronSchedule::Every { every_ms: 60_000 },
            CronAction::AgentRun {
                agent_id: "main".into(),
                channel: "cron".into(),
                message: "check things".into(),
            },
        )
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path()).unwrap();

        let j = job("daily");
        store.put(j.clone()).unwrap();
        assert_eq!(store.get(&j.id).unwrap().name, "daily");

        // A fresh store instance reads the same file back.
        let reloaded = CronStore::new(dir.path()).unwrap();
        assert_eq!(reloaded.list().len(), 1);
        assert_eq!(reloaded.get(&j.id).unwrap().name, "daily");
        assert!(dir.path().join("jobs.json").exists());
        assert!(!dir.path().join("jobs.json.tmp").exists(), "tmp renamed away");
    }

    #[test]
    fn test_delete_removes_job_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path()).unwrap();

        let j = job("gone");
        store.put(j.clone()).unwrap();
        store
            .record_run(CronRun {
                id: Ulid::new().to_string(),
                job_id: j.id.clone(),
                at: Utc::now(),
                duration_ms: 5,
                ok: true,
                error: None,
            })
            .unwrap();

        assert!(store.delete(&j.id).unwrap());
        assert!(store.get(&j.id).is_none());
        assert!(store.runs(&j.id).is_empty());
        assert!(!store.delete(&j.id).unwrap());
    }

    #[test]
    fn test_run_cap_discards_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CronStore::new(dir.path()).unwrap();
        let j = job("busy");
        store.put(j.clone()).unwrap();

        for i in 0..(MAX_RUNS_PER_JOB + 10) {
            store
                .record_run(CronRun {
                    id: format!("run-{i:04}"),
                    job_id: j.id.clone(),
                    at: Utc::now(),
                    duration_ms: 1,
                    ok: true,
                    error: None,
                })
                .unwrap();
        }

        let runs = store.runs(&j.id);
        assert_eq!(runs.len(), MAX_RUNS_PER_JOB);
        assert_eq!(runs[0].id, "run-0010", "oldest discarded first");
    }

    #[test]
    fn test_schedule_serde_shape() {
        let at = CronSchedule::At { at: Utc::now() };
        let json = serde_json::to_value(&at).unwrap();
        assert_eq!(json["kind"], "at");

        let every: CronSchedule =
            serde_json::from_str(r#"{"kind":"every","every_ms":30000}"#).unwrap();
        assert_eq!(every, CronSchedule::Every { every_ms: 30_000 });

        let cron: CronSchedule =
            serde_json::from_str(r#"{"kind":"cron","expr":"0 9 * * *"}"#).unwrap();
        assert!(cron.validate().is_ok());
    }

    #[test]
    fn test_schedule_validation() {
        assert!(CronSchedule::Every { every_ms: 0 }.validate().is_err());
        assert!(CronSchedule::Cron {
            expr: "not a cron".into()
        }
        .validate()
        .is_err());
        assert!(CronSchedule::Cron {
            expr: "*/5 * * * *".into()
        }
        .validate()
        .is_ok());
    }
}
