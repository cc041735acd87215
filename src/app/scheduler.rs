//! Fixed-interval timers driving the orchestrator.
//!
//! Discovery runs once at start and then on its own period; content sweeps and
//! health checks first fire after one full period. Missed ticks are skipped,
//! never replayed. Cancellation only stops a loop between runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::app::orchestrator::{Orchestrator, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleIntervals {
    pub discovery: Duration,
    pub content: Duration,
    pub health: Duration,
}

impl Default for ScheduleIntervals {
    fn default() -> Self {
        Self {
            discovery: Duration::from_secs(6 * 60 * 60),
            content: Duration::from_secs(2 * 60 * 60),
            health: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Task {
    Discovery,
    Content,
    Health,
}

impl Task {
    fn name(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Content => "content",
            Self::Health => "health",
        }
    }
}

pub struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops all loops, waiting for any in-flight run to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(?err, "scheduler loop ended abnormally");
            }
        }
        tracing::info!("scheduler stopped");
    }
}

pub fn spawn(orchestrator: Arc<Orchestrator>, intervals: ScheduleIntervals) -> SchedulerHandle {
    let cancel = CancellationToken::new();
    let tasks = vec![
        spawn_loop(
            Arc::clone(&orchestrator),
            Task::Discovery,
            intervals.discovery,
            true,
            cancel.clone(),
        ),
        spawn_loop(
            Arc::clone(&orchestrator),
            Task::Content,
            intervals.content,
            false,
            cancel.clone(),
        ),
        spawn_loop(orchestrator, Task::Health, intervals.health, false, cancel.clone()),
    ];
    SchedulerHandle { cancel, tasks }
}

fn spawn_loop(
    orchestrator: Arc<Orchestrator>,
    task: Task,
    period: Duration,
    run_at_start: bool,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = period.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let start = if run_at_start {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            task = task.name(),
            period_secs = period.as_secs(),
            "scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(task = task.name(), "scheduler loop stopping");
                    break;
                }
                _ = ticker.tick() => run_task(&orchestrator, task).await,
            }
        }
    })
}

async fn run_task(orchestrator: &Orchestrator, task: Task) {
    match task {
        Task::Discovery => match orchestrator.run_discovery_sweep().await {
            Ok(Outcome::Completed(summary)) => tracing::info!(
                checked = summary.sites_checked,
                discovered = summary.endpoints_discovered,
                "scheduled discovery sweep done"
            ),
            Ok(Outcome::AlreadyRunning) => {}
            Err(err) => tracing::error!(?err, "scheduled discovery sweep failed"),
        },
        Task::Content => match orchestrator.run_content_sweep().await {
            Ok(Outcome::Completed(summary)) => tracing::info!(
                fetched = summary.fetched,
                failed = summary.failed,
                changed = summary.changed,
                "scheduled content sweep done"
            ),
            Ok(Outcome::AlreadyRunning) => {}
            Err(err) => tracing::error!(?err, "scheduled content sweep failed"),
        },
        Task::Health => {
            orchestrator.run_health_check().await;
        }
    }
}
