//! Scheduler loop driving the [`Orchestrator`] from a single task.
//!
//! Each tick first drains the inbox, applying every queued event in
//! arrival order, then lets the orchestrator run pending synchronous stages
//! and poll its process groups.

use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use super::inbox::Inbound;
use super::sequencer::Orchestrator;

/// Spawn the scheduler loop.
///
/// The loop ends when `cancel` fires or every inbox sender is dropped; in
/// both cases the active session is torn down before the task completes.
#[must_use]
pub fn spawn_orchestrator(
    orchestrator: Orchestrator,
    inbox: mpsc::Receiver<Inbound>,
    tick: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(orchestrator, inbox, tick, cancel).instrument(info_span!("orchestrator")))
}

/// Scheduler loop body.
pub async fn run(
    mut orchestrator: Orchestrator,
    mut inbox: mpsc::Receiver<Inbound>,
    tick: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(tick_ms = tick.as_millis(), "orchestrator started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("orchestrator cancellation requested");
                break;
            }
            _ = interval.tick() => {}
        }

        let mut closed = false;
        loop {
            match inbox.try_recv() {
                Ok(inbound) => orchestrator.handle(inbound).await,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }
        if closed {
            debug!("orchestrator inbox closed");
            break;
        }

        orchestrator.tick().await;
    }

    orchestrator.shutdown().await;
    info!("orchestrator stopped");
}
