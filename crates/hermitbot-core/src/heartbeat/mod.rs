//! Heartbeat: periodic self-prompting.
//!
//! A heartbeat feeds the router a system-originated `InboundMessage` on a
//! fixed cadence, letting the agent act without being spoken to (daily
//! summaries, watch-this-for-me check-ins). Nothing here is persisted:
//! whoever wires the process up decides its heartbeats at startup, unlike
//! cron jobs which live on disk and survive restarts.
//!
//! Two ways to drive one: [`Heartbeat::run`] owns its own loop, or
//! [`Heartbeat::into_action`] hands the cadence to the shared [`Scheduler`]
//! so heartbeats stop and drain together with everything else.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::events::InboundMessage;
use crate::error::DomainError;
use crate::scheduler::{Schedule, Scheduler, SchedulerTask};

/// Scheduler action tag under which [`Heartbeat::into_action`] registers.
pub const HEARTBEAT_ACTION: &str = "heartbeat";

/// Sender id stamped on every beat so hooks can tell beats from users.
const HEARTBEAT_SENDER: &str = "heartbeat";

/// A periodic self-prompt.
///
/// Construct with [`Heartbeat::new`]; the beat lands on channel `"cli"`,
/// session `"direct"` unless retargeted with [`Heartbeat::target`].
pub struct Heartbeat {
    period: Duration,
    prompt: String,
    channel: String,
    session_id: String,
}

impl Heartbeat {
    pub fn new(period: Duration, prompt: impl Into<String>) -> Self {
        Self {
            period,
            prompt: prompt.into(),
            channel: "cli".to_string(),
            session_id: "direct".to_string(),
        }
    }

    /// Address the beat at a specific channel and session.
    pub fn target(mut self, channel: impl Into<String>, session_id: impl Into<String>) -> Self {
        self.channel = channel.into();
        self.session_id = session_id.into();
        self
    }

    fn beat(&self) -> InboundMessage {
        InboundMessage {
            session_id: self.session_id.clone(),
            content: self.prompt.clone(),
            channel_name: self.channel.clone(),
            sender_id: Some(HEARTBEAT_SENDER.into()),
            ..InboundMessage::default()
        }
    }

    /// Beat until cancelled or the receiving side goes away.
    ///
    /// The first beat waits one full period; a freshly started process
    /// should not be prompting itself before the channels are up. A beat
    /// that cannot be enqueued ends the loop, since a closed inbound queue
    /// means shutdown is already underway.
    pub async fn run(self, tx: mpsc::Sender<InboundMessage>, cancel: CancellationToken) {
        info!(
            period_secs = self.period.as_secs(),
            channel = %self.channel,
            session = %self.session_id,
            "Heartbeat loop running"
        );

        let mut ticks = tokio::time::interval_at(
            tokio::time::Instant::now() + self.period,
            self.period,
        );
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Heartbeat loop stopped");
                    return;
                }
                _ = ticks.tick() => {
                    debug!(channel = %self.channel, "Beat");
                    if tx.send(self.beat()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Register this heartbeat on the scheduler instead of looping itself.
    ///
    /// The beat template is captured once; each scheduler firing enqueues a
    /// fresh copy of it.
    pub fn into_action(
        self,
        scheduler: &Scheduler,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(), DomainError> {
        let period = self.period;
        let template = self.beat();
        scheduler.register_action(HEARTBEAT_ACTION, move |_token| {
            let tx = tx.clone();
            let beat = template.clone();
            async move {
                let _ = tx.send(beat).await;
            }
        });
        scheduler.add_task(SchedulerTask {
            action: HEARTBEAT_ACTION.to_string(),
            schedule: Schedule::Every(period),
            one_shot: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_beat_arrives_after_one_period() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let hb = Heartbeat::new(Duration::from_millis(40), "check in").target("telegram", "42");
        tokio::spawn(hb.run(tx, cancel.clone()));

        // Nothing lands before the first period elapses.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());

        let beat = tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .expect("no beat within 300 ms")
            .expect("inbound queue closed");
        assert_eq!(beat.content, "check in");
        assert_eq!(beat.channel_name, "telegram");
        assert_eq!(beat.session_id, "42");
        assert_eq!(beat.sender_id.as_deref(), Some(HEARTBEAT_SENDER));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_silences_the_loop() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let hb = Heartbeat::new(Duration::from_millis(30), "never delivered");
        let handle = tokio::spawn(hb.run(tx, cancel.clone()));

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "beat arrived after cancellation");
    }

    #[tokio::test]
    async fn test_closed_queue_ends_the_loop() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let cancel = CancellationToken::new();

        let hb = Heartbeat::new(Duration::from_millis(10), "into the void");
        let handle = tokio::spawn(hb.run(tx, cancel));

        // The loop notices the closed queue on its first send and exits.
        tokio::time::timeout(Duration::from_millis(300), handle)
            .await
            .expect("loop kept running against a closed queue")
            .unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_carries_the_cadence() {
        let scheduler = Scheduler::new();
        let (tx, mut rx) = mpsc::channel(4);

        Heartbeat::new(Duration::from_millis(30), "scheduled beat")
            .into_action(&scheduler, tx)
            .unwrap();
        scheduler.start();

        let beat = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("scheduler never fired the heartbeat")
            .unwrap();
        assert_eq!(beat.content, "scheduled beat");
        assert_eq!(beat.channel_name, "cli");
        scheduler.stop().await;
    }
}
