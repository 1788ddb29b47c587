//! hermitbot-core: core runtime for the hermitbot agent server.
//!
//! This crate contains the building blocks of a multi-channel, multi-LLM
//! agent server:
//!
//! - [`config`] — Typed configuration loading from JSON
//! - [`provider`] — LLM provider trait, chat/stream types, classified retry
//! - [`error`] — Domain error taxonomy and the failure classifier
//! - [`bus`] — Event bus and channel message bus
//! - [`tools`] — Tool trait, registry, scoped executor, approval seam
//! - [`memory`] — Memory provider seam
//! - [`agent`] — Agent loop, context building, compression, context guard,
//!   transcript repair, streaming accumulation, sub-agents
//! - [`session`] — Session persistence and the per-session locker
//! - [`router`] — Channel-to-agent routing, hooks, scanning, onboarding
//! - [`scheduler`] — Cron/interval/one-shot task scheduling
//! - [`cron`] — Persistent cron-job management on top of the scheduler
//! - [`heartbeat`] — Proactive periodic agent wake-up
//! - [`tenant`] — Per-tenant daily quotas
//! - [`workflow`] — Pipeline/run data model
//! - [`audit`] — Audit logging seam
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use hermitbot_core::agent::context::{ContextBuilder, ContextConfig};
//! use hermitbot_core::agent::{Agent, AgentConfig};
//! use hermitbot_core::config::Config;
//! use hermitbot_core::router::Router;
//! use hermitbot_core::session::SessionManager;
//! use hermitbot_core::tools::ToolRegistry;
//!
//! # fn wire(provider: Arc<dyn hermitbot_core::provider::LlmProvider>) -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let sessions = Arc::new(SessionManager::new(&config.session_dir())?);
//! let agent = Arc::new(Agent::new(
//!     provider,
//!     Arc::new(ToolRegistry::new()),
//!     ContextBuilder::new(config.context_config()),
//!     config.agent_config(),
//! ));
//! let router = Router::new(agent, sessions);
//! # let _ = router;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod audit;
pub mod bus;
pub mod config;
pub mod cron;
pub mod error;
pub mod heartbeat;
pub mod memory;
pub mod provider;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod tenant;
pub mod tools;
pub mod workflow;
