//! Fixed-interval job runner
//!
//! The job runs once immediately, then on every tick. A run that overruns the
//! interval delays the next one instead of bunching missed ticks.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, instrument, warn};

#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run the job now, outside the tick schedule
    RunNow { respond_to: oneshot::Sender<()> },
    Shutdown,
}

struct SchedulerActor<F> {
    job: F,
    interval_duration: Duration,
    command_rx: mpsc::Receiver<SchedulerCommand>,
}

impl<F, Fut> SchedulerActor<F>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    #[instrument(skip(self), fields(interval = ?self.interval_duration))]
    async fn run(mut self) {
        debug!("starting scheduler");

        let mut ticker = interval(self.interval_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    (self.job)().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SchedulerCommand::RunNow { respond_to } => {
                            debug!("received RunNow command");
                            (self.job)().await;
                            let _ = respond_to.send(());
                        }

                        SchedulerCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("scheduler stopped");
    }
}

/// Handle to a running schedule
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn run_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::RunNow { respond_to: tx })
            .await
            .context("failed to send RunNow command")?;

        rx.await.context("failed to receive response")?;
        Ok(())
    }

    /// Stop the schedule; a run in progress completes first
    pub async fn shutdown(self) -> Result<()> {
        self.sender
            .send(SchedulerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        self.task.await.context("scheduler task panicked")?;
        Ok(())
    }
}

/// Run `job` now and then every `every`
pub fn run_interval<F, Fut>(every: Duration, job: F) -> SchedulerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (sender, command_rx) = mpsc::channel(8);
    let actor = SchedulerActor {
        job,
        interval_duration: every,
        command_rx,
    };

    SchedulerHandle {
        sender,
        task: tokio::spawn(actor.run()),
    }
}
