//! Bounded concurrent spawn pool for delegated agent runs.
//!
//! Each spawn takes a semaphore slot, gets a fresh session from the
//! injected factory-built agent, and runs a single `handle_message` under
//! the manager's timeout. Parallel spawns aggregate per-task errors while
//! keeping the partial results.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::bus::events::{topics, Event};
use crate::bus::EventBus;
use crate::error::{DomainError, Sentinel};
use crate::session::Session;

/// Builds a fresh agent per delegated task.
pub type AgentFactory = Arc<dyn Fn() -> Arc<Agent> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct SubAgentConfig {
    /// Concurrent delegated runs.
    pub max_concurrent: usize,
    /// How long to wait for a free slot.
    pub slot_timeout: Duration,
    /// Wall-clock budget per delegated run.
    pub task_timeout: Duration,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            slot_timeout: Duration::from_secs(10),
            task_timeout: Duration::from_secs(60),
        }
    }
}

pub struct SubAgentManager {
    factory: AgentFactory,
    semaphore: Arc<Semaphore>,
    config: SubAgentConfig,
    bus: Option<Arc<EventBus>>,
}

impl SubAgentManager {
    pub fn new(factory: AgentFactory, config: SubAgentConfig) -> Self {
        Self {
            factory,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Run one delegated task to completion and return its final text.
    pub async fn spawn(&self, task: &str, cancel: &CancellationToken) -> anyhow::Result<String> {
        let permit = tokio::time::timeout(
            self.config.slot_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| DomainError::new("SubAgentManager.Spawn", Sentinel::Timeout))?
        .map_err(|_| DomainError::new("SubAgentManager.Spawn", Sentinel::Disabled))?;

        let agent = (*self.factory)();
        let session = Arc::new(Session::new(&format!("subagent:{}", ulid::Ulid::new())));
        debug!(agent = agent.id(), session = session.id(), "Spawning sub-agent");
        if let Some(bus) = &self.bus {
            bus.publish(
                Event::new(topics::AGENT_DELEGATED, session.id())
                    .with_payload(json!({"agent": agent.id()})),
            );
        }

        let result = tokio::time::timeout(
            self.config.task_timeout,
            agent.handle_message(&session, task, cancel),
        )
        .await
        .map_err(|_| DomainError::new("SubAgentManager.Spawn", Sentinel::Timeout))?;

        drop(permit);
        result
    }

    /// Run all tasks concurrently.
    ///
    /// Returns per-task results in input order (`None` where a task
    /// failed) plus one aggregated error when any task failed.
    pub async fn spawn_parallel(
        self: &Arc<Self>,
        tasks: &[String],
        cancel: &CancellationToken,
    ) -> (Vec<Option<String>>, Option<anyhow::Error>) {
        let mut join = JoinSet::new();
        for (idx, task) in tasks.iter().cloned().enumerate() {
            let manager = Arc::clone(self);
            let cancel = cancel.clone();
            join.spawn(async move { (idx, manager.spawn(&task, &cancel).await) });
        }

        let mut results: Vec<Option<String>> = (0..tasks.len()).map(|_| None).collect();
        let mut failures: Vec<(usize, String)> = Vec::new();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((idx, Ok(text))) => results[idx] = Some(text),
                Ok((idx, Err(e))) => failures.push((idx, format!("{e:#}"))),
                Err(e) => {
                    warn!(error = %e, "Sub-agent task failed to join");
                    failures.push((usize::MAX, e.to_string()));
                }
            }
        }

        if failures.is_empty() {
            return (results, None);
        }
        failures.sort_by_key(|(idx, _)| *idx);
        let joined = failures
            .iter()
            .map(|(idx, msg)| format!("task {idx}: {msg}"))
            .collect::<Vec<_>>()
            .join("; ");
        (results, Some(anyhow::anyhow!("sub-agent failures: {joined}")))
    }
}
