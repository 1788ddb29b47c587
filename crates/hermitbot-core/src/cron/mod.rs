//! Cron-job manager.
//!
//! Thin CRUD orchestrator on top of the [`Scheduler`] and the
//! [`CronStore`]. Jobs fire by handing a synthetic inbound message
//! (`session "cron:<jobID>"`, channel `"cron"`) to the injected
//! [`MessageHandler`] — normally the router — so scheduled agent runs take
//! exactly the same path as user messages.

pub mod store;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use ulid::Ulid;

use crate::bus::events::{topics, Event, InboundMessage, OutboundMessage};
use crate::bus::EventBus;
use crate::error::{DomainError, Sentinel};
use crate::scheduler::Scheduler;
use store::{CronAction, CronJob, CronRun, CronSchedule, CronStore};

/// Whatever turns an inbound message into an outbound one — in practice
/// the router.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: InboundMessage) -> anyhow::Result<OutboundMessage>;
}

/// Patchable job fields. `Action.Kind` is deliberately not patchable; only
/// the action message is.
#[derive(Debug, Default, Clone)]
pub struct CronJobPatch {
    pub name: Option<String>,
    pub schedule: Option<CronSchedule>,
    pub message: Option<String>,
    pub enabled: Option<bool>,
}

pub struct CronManager {
    store: Arc<CronStore>,
    scheduler: Arc<Scheduler>,
    handler: Arc<dyn MessageHandler>,
    bus: Option<Arc<EventBus>>,
}

impl CronManager {
    pub fn new(
        store: Arc<CronStore>,
        scheduler: Arc<Scheduler>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            store,
            scheduler,
            handler,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Validate, persist, and schedule a new job.
    pub fn create(
        self: &Arc<Self>,
        name: &str,
        schedule: CronSchedule,
        action: CronAction,
    ) -> anyhow::Result<CronJob> {
        schedule.validate()?;

        let mut job = CronJob::new(name, schedule, action);
        job.next_run_at = job.schedule.to_schedule()?.next_after(Utc::now());
        self.store.put(job.clone())?;

        if let Err(e) = self.schedule_job(&job) {
            // Keep store and scheduler consistent: a job we cannot
            // schedule must not survive on disk.
            let _ = self.store.delete(&job.id);
            return Err(e.into());
        }

        info!(id = %job.id, name = %job.name, "Created cron job");
        self.publish(topics::CRON_JOB_CREATED, &job.id, json!({"name": &job.name}));
        Ok(job)
    }

    /// Apply a patch. Schedule or enabled changes re-register the
    /// scheduler entry (only when the job ends up enabled).
    pub fn update(self: &Arc<Self>, id: &str, patch: CronJobPatch) -> anyhow::Result<CronJob> {
        let mut job = self
            .store
            .get(id)
            .ok_or_else(|| DomainError::new("CronManager.Update", Sentinel::NotFound))?;

        let schedule_changed = patch.schedule.is_some();
        let enabled_changed = patch.enabled.is_some_and(|e| e != job.enabled);

        if let Some(name) = patch.name {
            job.name = name;
        }
        if let Some(schedule) = patch.schedule {
            schedule.validate()?;
            job.schedule = schedule;
        }
        if let Some(message) = patch.message {
            job.action.set_message(&message);
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = enabled;
        }
        job.updated_at = Utc::now();
        job.next_run_at = if job.enabled {
            job.schedule.to_schedule()?.next_after(Utc::now())
        } else {
            None
        };

        self.store.put(job.clone())?;

        if schedule_changed || enabled_changed {
            self.scheduler.remove_dynamic_task(id);
            if job.enabled {
                self.schedule_job(&job)?;
            }
        }

        self.publish(topics::CRON_JOB_UPDATED, &job.id, json!({"name": &job.name}));
        Ok(job)
    }

    /// Remove a job from both the scheduler and the store.
    pub fn delete(&self, id: &str) -> anyhow::Result<bool> {
        self.scheduler.remove_dynamic_task(id);
        let removed = self.store.delete(id)?;
        if removed {
            info!(id, "Deleted cron job");
            self.publish(topics::CRON_JOB_DELETED, id, json!(null));
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<CronJob> {
        self.store.get(id)
    }

    pub fn list(&self) -> Vec<CronJob> {
        self.store.list()
    }

    /// Startup pass: schedule every enabled job, disabling expired
    /// one-shots on disk instead of scheduling them.
    pub fn load_and_schedule(self: &Arc<Self>) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut scheduled = 0;

        for mut job in self.store.list() {
            if !job.enabled {
                continue;
            }
            if let CronSchedule::At { at } = job.schedule {
                if at <= now {
                    info!(id = %job.id, name = %job.name, "Disabling expired one-shot job");
                    job.enabled = false;
                    job.next_run_at = None;
                    job.updated_at = now;
                    self.store.put(job)?;
                    continue;
                }
            }
            self.schedule_job(&job)?;
            scheduled += 1;
        }

        info!(scheduled, "Cron jobs loaded");
        Ok(scheduled)
    }

    fn schedule_job(self: &Arc<Self>, job: &CronJob) -> Result<(), DomainError> {
        let schedule = job.schedule.to_schedule()?;
        let manager = Arc::clone(self);
        let job_id = job.id.clone();
        self.scheduler.add_dynamic_task(
            &job.id,
            schedule,
            move |_token| {
                let manager = Arc::clone(&manager);
                let job_id = job_id.clone();
                async move {
                    manager.execute_job(&job_id).await;
                }
            },
            job.schedule.is_one_shot(),
        )
    }

    /// One firing: resolve the job, run its action through the handler,
    /// record the run, update job stats.
    async fn execute_job(&self, job_id: &str) {
        let Some(mut job) = self.store.get(job_id) else {
            warn!(job_id, "Fired cron job no longer exists");
            return;
        };

        info!(id = %job.id, name = %job.name, "Cron job fired");
        let started_at = Utc::now();
        let timer = Instant::now();

        let msg = InboundMessage {
            session_id: format!("cron:{job_id}"),
            content: job.action.message().to_string(),
            channel_name: "cron".to_string(),
            ..InboundMessage::default()
        };
        let result = self.handler.handle(msg).await;
        let ok = result.is_ok();
        if let Err(e) = &result {
            warn!(id = %job.id, error = %e, "Cron job handler failed");
        }

        if let Err(e) = self.store.record_run(CronRun {
            id: Ulid::new().to_string(),
            job_id: job.id.clone(),
            at: started_at,
            duration_ms: timer.elapsed().as_millis() as u64,
            ok,
            error: result.err().map(|e| format!("{e:#}")),
        }) {
            warn!(id = %job.id, error = %e, "Failed to record cron run");
        }

        job.last_run_at = Some(started_at);
        job.run_count += 1;
        job.updated_at = Utc::now();
        if job.schedule.is_one_shot() {
            job.enabled = false;
        }
        job.next_run_at = self.scheduler.get_next_run(&job.id);
        if let Err(e) = self.store.put(job.clone()) {
            warn!(id = %job.id, error = %e, "Failed to persist cron job stats");
        }

        self.publish(topics::CRON_JOB_FIRED, &job.id, json!({"ok": ok}));
    }

    fn publish(&self, topic: &str, job_id: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(Event::new(topic, job_id).with_payload(payload));
        }
    }
}
