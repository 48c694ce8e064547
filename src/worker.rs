use crate::config::{AbortedRequestPolicy, EngineSettings};
use crate::credentials::CredentialPool;
use crate::error::WorkerError;
use crate::model::{ActionNode, WorkerAssignment, WorkerMessage, WorkerSummary};
use crate::runner::{ClientFactory, Outcome, Runner};
use crate::user::{UserState, VirtualUser};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub(crate) struct Tally {
    requests: AtomicU64,
    errors: AtomicU64,
}

impl Tally {
    pub(crate) fn record(&self, outcome: &Outcome) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if outcome.is_error() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_aborted(&self, policy: AbortedRequestPolicy) {
        if policy == AbortedRequestPolicy::CountAsError {
            self.requests.fetch_add(1, Ordering::Relaxed);
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn totals(&self) -> (u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

/// Everything the users of one worker share.
pub(crate) struct Shard {
    pub(crate) run_id: String,
    pub(crate) worker_id: usize,
    pub(crate) nodes: Vec<ActionNode>,
    pub(crate) input: Map<String, Value>,
    pub(crate) runner: Runner,
    pub(crate) pool: CredentialPool,
    pub(crate) tx: mpsc::Sender<WorkerMessage>,
    pub(crate) cancel: CancellationToken,
    pub(crate) end_time: Instant,
    pub(crate) settings: EngineSettings,
    pub(crate) tally: Tally,
}

impl Shard {
    pub(crate) fn expired(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.end_time
    }
}

/// Start offset of the `index`-th user: `floor(index / share * ramp_up * 1000)` ms.
pub fn ramp_up_delay(index: usize, share: usize, ramp_up_secs: u64) -> Duration {
    if share == 0 {
        return Duration::ZERO;
    }
    let millis = (index as u128)
        .saturating_mul(ramp_up_secs as u128)
        .saturating_mul(1000)
        / share as u128;
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `secs` from now, clamped to a far-future instant when that is not representable.
pub fn deadline_after(secs: u64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_secs(secs))
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Runs one shard of a run on its own thread and single-threaded runtime.
pub struct Worker {
    assignment: WorkerAssignment,
    pool: CredentialPool,
    tx: mpsc::Sender<WorkerMessage>,
    settings: EngineSettings,
    client: ClientFactory,
}

impl Worker {
    pub fn new(
        assignment: WorkerAssignment,
        pool: CredentialPool,
        tx: mpsc::Sender<WorkerMessage>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            assignment,
            pool,
            tx,
            settings,
            client: Arc::new(|_: usize| Runner::build_client()),
        }
    }

    pub fn with_client_factory(mut self, client: ClientFactory) -> Self {
        self.client = client;
        self
    }

    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<Result<WorkerSummary, WorkerError>>> {
        thread::Builder::new()
            .name(format!("flow-worker-{}", self.assignment.worker_id))
            .spawn(move || self.run_blocking())
    }

    /// Blocks the calling thread until the shard finishes.
    pub fn run_blocking(self) -> Result<WorkerSummary, WorkerError> {
        let tx = self.tx.clone();
        let run_id = self.assignment.run_id.clone();
        let worker_id = self.assignment.worker_id;

        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(WorkerError::from)
            .and_then(|rt| rt.block_on(self.run()));

        if let Err(e) = &result {
            tracing::error!(run_id = %run_id, worker_id, error = %e, "worker crashed");
            let _ = tx.blocking_send(WorkerMessage::error(format!(
                "[Run {run_id}] Worker {worker_id} crashed: {e}"
            )));
        }
        result
    }

    async fn notify(&self, msg: WorkerMessage) -> Result<(), WorkerError> {
        self.tx.send(msg).await.map_err(|_| WorkerError::ChannelClosed)
    }

    fn user_exit(&self, joined: Result<UserState, JoinError>) -> Option<WorkerMessage> {
        match joined {
            Err(e) if e.is_panic() => Some(WorkerMessage::error(format!(
                "[Worker {}] Virtual user crashed: {e}",
                self.assignment.worker_id
            ))),
            _ => None,
        }
    }

    /// Reaps users until the deadline or until every user has stopped. A crashed
    /// user is reported and its siblings keep going.
    async fn supervise(
        &self,
        users: &mut JoinSet<UserState>,
        end_time: Instant,
    ) -> Result<(), WorkerError> {
        let deadline = tokio::time::sleep_until(end_time);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(()),
                joined = users.join_next() => match joined {
                    Some(joined) => {
                        if let Some(msg) = self.user_exit(joined) {
                            self.notify(msg).await?;
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// Waits out the grace period for cancelled users, then drops the stragglers.
    async fn settle(&self, users: &mut JoinSet<UserState>) -> Result<(), WorkerError> {
        let drain = async {
            while let Some(joined) = users.join_next().await {
                if let Some(msg) = self.user_exit(joined) {
                    self.notify(msg).await?;
                }
            }
            Ok::<_, WorkerError>(())
        };
        let drained = tokio::time::timeout(self.settings.grace_period(), drain).await;
        match drained {
            Ok(drained) => drained,
            Err(_) => {
                self.notify(WorkerMessage::info(format!(
                    "[Worker {}] Force exiting...",
                    self.assignment.worker_id
                )))
                .await?;
                users.shutdown().await;
                Ok(())
            }
        }
    }

    async fn run(self) -> Result<WorkerSummary, WorkerError> {
        let worker_id = self.assignment.worker_id;
        let share = self.assignment.ccu_share;
        let duration = self.assignment.duration;
        let runner = Runner::new((self.client)(worker_id)?, &self.settings);
        let cancel = CancellationToken::new();
        let end_time = deadline_after(duration);

        self.notify(WorkerMessage::info(format!(
            "[Worker {worker_id}] Starting {share} concurrent users for {duration}s"
        )))
        .await?;

        let shard = Arc::new(Shard {
            run_id: self.assignment.run_id.clone(),
            worker_id,
            nodes: self.assignment.nodes.clone(),
            input: self.assignment.input.clone(),
            runner,
            pool: self.pool.clone(),
            tx: self.tx.clone(),
            cancel: cancel.clone(),
            end_time,
            settings: self.settings.clone(),
            tally: Tally::default(),
        });

        let mut users = JoinSet::new();
        for index in 0..share {
            let delay = ramp_up_delay(index, share, self.assignment.ramp_up_time);
            users.spawn(VirtualUser::new(index, delay, shard.clone()).run());
        }

        self.supervise(&mut users, end_time).await?;

        cancel.cancel();
        self.notify(WorkerMessage::info(format!(
            "[Worker {worker_id}] Duration reached ({duration}s). Aborting in-flight requests..."
        )))
        .await?;
        self.settle(&mut users).await?;

        let (total_requests, total_errors) = shard.tally.totals();
        let summary = WorkerSummary {
            message: format!(
                "[Worker {worker_id}] Completed: {total_requests} requests, {total_errors} errors"
            ),
            worker_id,
            total_requests,
            total_errors,
        };
        tracing::info!(worker_id, total_requests, total_errors, "worker finished");
        self.notify(WorkerMessage::Done(summary.clone())).await?;
        Ok(summary)
    }
}
