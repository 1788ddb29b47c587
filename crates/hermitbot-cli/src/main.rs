//! hermitbot CLI — configuration, session, and cron-job management.
//!
//! Usage:
//!   hermitbot init           — Create a default configuration
//!   hermitbot status         — Show current configuration and data stores
//!   hermitbot sessions list  — List persisted sessions
//!   hermitbot sessions reap  — Remove sessions older than the configured age
//!   hermitbot cron list      — List scheduled jobs
//!   hermitbot cron add       — Add a job (--cron / --every / --at)
//!
//! The agent server itself is embedded by channel hosts through
//! `hermitbot-core`; this binary manages the on-disk state those hosts
//! share.

use anyhow::Result;
use clap::{Parser, Subcommand};

use hermitbot_core::config::Config;
use hermitbot_core::cron::store::{CronAction, CronJob, CronSchedule, CronStore};
use hermitbot_core::session::SessionManager;

#[derive(Parser)]
#[command(
    name = "hermitbot",
    version,
    about = "A multi-channel, multi-LLM agent server",
    long_about = "hermitbot — a multi-channel agent server written in Rust.\n\nThis binary manages configuration, sessions, and cron jobs; channels and\nLLM providers plug into hermitbot-core as libraries."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or reset the default configuration
    Init,

    /// Show configuration status and store contents
    Status,

    /// Manage conversation sessions
    Sessions {
        #[command(subcommand)]
        action: SessionCommands,
    },

    /// Manage scheduled jobs
    Cron {
        #[command(subcommand)]
        action: CronCommands,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List all persisted sessions
    List,
    /// Delete a session by external key (e.g. "telegram:42")
    Delete { key: String },
    /// Remove sessions older than the configured reap age
    Reap {
        /// Override the configured age in days
        #[arg(long)]
        days: Option<i64>,
    },
}

#[derive(Subcommand)]
enum CronCommands {
    /// List all jobs
    List,
    /// Add a new job
    Add {
        /// Job name
        #[arg(short, long)]
        name: String,
        /// Cron expression (e.g. "0 9 * * *")
        #[arg(long, conflicts_with_all = ["every", "at"])]
        cron: Option<String>,
        /// Interval (e.g. "30m", "90s")
        #[arg(long, conflicts_with_all = ["cron", "at"])]
        every: Option<String>,
        /// One-shot RFC 3339 timestamp (e.g. "2026-08-02T09:00:00Z")
        #[arg(long, conflicts_with_all = ["cron", "every"])]
        at: Option<String>,
        /// Message the agent receives when the job fires
        #[arg(short, long)]
        message: String,
        /// Agent to drive (default: "main")
        #[arg(long, default_value = "main")]
        agent: String,
    },
    /// Remove a job
    Remove { id: String },
    /// Enable or disable a job
    Enable {
        id: String,
        /// Disable instead of enable
        #[arg(long)]
        off: bool,
    },
    /// Show the run history of a job
    Runs { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init => cmd_init(),
        Commands::Status => cmd_status(),
        Commands::Sessions { action } => cmd_sessions(action),
        Commands::Cron { action } => cmd_cron(action),
    }
}

fn cmd_init() -> Result<()> {
    let path = Config::write_default_template()?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn cmd_status() -> Result<()> {
    let config = Config::load()?;
    let sessions = SessionManager::new(&config.session_dir())?;
    let loaded = sessions.load_all()?;
    let cron = CronStore::new(&config.cron_dir())?;
    let jobs = cron.list();
    let enabled = jobs.iter().filter(|j| j.enabled).count();

    println!("Config:   {}", Config::default_path().display());
    println!(
        "Model:    {}",
        config.agent.model.as_deref().unwrap_or("(provider default)")
    );
    println!("Sessions: {loaded} in {}", config.session_dir().display());
    println!(
        "Cron:     {} jobs ({} enabled) in {}",
        jobs.len(),
        enabled,
        config.cron_dir().display()
    );
    Ok(())
}

fn cmd_sessions(action: SessionCommands) -> Result<()> {
    let config = Config::load()?;
    let manager = SessionManager::new(&config.session_dir())?;
    manager.load_all()?;

    match action {
        SessionCommands::List => {
            let mut rows: Vec<(String, String, usize)> = Vec::new();
            for key in manager.keys() {
                if let Some(session) = manager.get(&key) {
                    rows.push((key, session.updated_at().to_rfc3339(), session.len()));
                }
            }
            rows.sort_by(|a, b| b.1.cmp(&a.1));
            if rows.is_empty() {
                println!("No sessions.");
            }
            for (key, updated, len) in rows {
                println!("{key}  {len} messages  updated {updated}");
            }
        }
        SessionCommands::Delete { key } => {
            if manager.remove(&key) {
                println!("Deleted session {key}");
            } else {
                println!("No session {key}");
            }
        }
        SessionCommands::Reap { days } => {
            let days = days.unwrap_or(config.session.reap_after_days);
            let reaped = manager.reap_older_than(chrono::Duration::days(days));
            println!("Reaped {reaped} sessions older than {days} days");
        }
    }
    Ok(())
}

fn cmd_cron(action: CronCommands) -> Result<()> {
    let config = Config::load()?;
    let store = CronStore::new(&config.cron_dir())?;

    match action {
        CronCommands::List => {
            let jobs = store.list();
            if jobs.is_empty() {
                println!("No cron jobs.");
            }
            for job in jobs {
                let state = if job.enabled { "enabled" } else { "disabled" };
                let next = job
                    .next_run_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{}  {}  {}  runs={}  next={}",
                    job.id, job.name, state, job.run_count, next
                );
            }
        }
        CronCommands::Add {
            name,
            cron,
            every,
            at,
            message,
            agent,
        } => {
            let schedule = parse_schedule_args(cron, every, at)?;
            schedule.validate()?;
            let mut job = CronJob::new(
                &name,
                schedule,
                CronAction::AgentRun {
                    agent_id: agent,
                    channel: "cron".into(),
                    message,
                },
            );
            job.next_run_at = job.schedule.to_schedule()?.next_after(chrono::Utc::now());
            store.put(job.clone())?;
            println!("Added job {} ({})", job.id, job.name);
        }
        CronCommands::Remove { id } => {
            if store.delete(&id)? {
                println!("Removed job {id}");
            } else {
                println!("No job {id}");
            }
        }
        CronCommands::Enable { id, off } => match store.get(&id) {
            Some(mut job) => {
                job.enabled = !off;
                job.updated_at = chrono::Utc::now();
                store.put(job)?;
                println!("Job {id} {}", if off { "disabled" } else { "enabled" });
            }
            None => println!("No job {id}"),
        },
        CronCommands::Runs { id } => {
            let runs = store.runs(&id);
            if runs.is_empty() {
                println!("No recorded runs for {id}");
            }
            for run in runs {
                let status = if run.ok { "ok" } else { "failed" };
                println!(
                    "{}  {}  {}ms  {}{}",
                    run.at.to_rfc3339(),
                    status,
                    run.duration_ms,
                    run.id,
                    run.error.map(|e| format!("  {e}")).unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn parse_schedule_args(
    cron: Option<String>,
    every: Option<String>,
    at: Option<String>,
) -> Result<CronSchedule> {
    if let Some(expr) = cron {
        return Ok(CronSchedule::Cron { expr });
    }
    if let Some(every) = every {
        let schedule = hermitbot_core::scheduler::Schedule::parse(&every)?;
        let hermitbot_core::scheduler::Schedule::Every(duration) = schedule else {
            anyhow::bail!("--every expects a duration like 30m or 90s");
        };
        return Ok(CronSchedule::Every {
            every_ms: duration.as_millis() as u64,
        });
    }
    if let Some(at) = at {
        let at = chrono::DateTime::parse_from_rfc3339(&at)
            .map_err(|e| anyhow::anyhow!("invalid --at timestamp: {e}"))?
            .with_timezone(&chrono::Utc);
        return Ok(CronSchedule::At { at });
    }
    anyhow::bail!("one of --cron, --every, or --at is required")
}
