//! Splits a run into worker shards, starts them and consumes their messages.

use crate::config::{EngineSettings, RunConfig};
use crate::credentials::CredentialArbiter;
use crate::error::ConfigError;
use crate::model::{Credential, Flow, RunStatus, WorkerAssignment, WorkerMessage, WorkerSummary};
use crate::runner::{ClientFactory, Runner};
use crate::sink::{BufferedEmitter, LogStore, RealtimeSink};
use crate::worker::Worker;
use futures::future::join_all;
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// `[base + 1; ccu % threads] ++ [base; ...]` with `base = ccu / threads`.
pub fn distribute_ccu(ccu: usize, threads: usize) -> Vec<usize> {
    if threads == 0 {
        return Vec::new();
    }
    let base = ccu / threads;
    let remainder = ccu % threads;
    (0..threads)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// `credentials[j]` goes to worker `j % threads`.
pub fn distribute_credentials(credentials: &[Credential], threads: usize) -> Vec<Vec<Credential>> {
    let mut shares = vec![Vec::new(); threads];
    if threads == 0 {
        return shares;
    }
    for (j, credential) in credentials.iter().enumerate() {
        shares[j % threads].push(credential.clone());
    }
    shares
}

pub fn plan(run_id: &str, flow: &Flow, config: &RunConfig) -> Vec<WorkerAssignment> {
    let ccu = distribute_ccu(config.ccu, config.threads);
    let credentials = distribute_credentials(&config.credentials, config.threads);
    ccu.into_iter()
        .zip(credentials)
        .enumerate()
        .map(|(worker_id, (ccu_share, credentials_share))| WorkerAssignment {
            run_id: run_id.to_string(),
            worker_id,
            ccu_share,
            ramp_up_time: config.ramp_up_time,
            duration: config.duration,
            nodes: flow.sequence.clone(),
            input: config.input.clone(),
            credentials_share,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub workers: Vec<WorkerSummary>,
    pub errors: Vec<String>,
}

impl RunReport {
    pub fn total_requests(&self) -> u64 {
        self.workers.iter().map(|w| w.total_requests).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.workers.iter().map(|w| w.total_errors).sum()
    }
}

type StatusTable = Arc<Mutex<HashMap<String, RunStatus>>>;

pub struct RunHandle {
    id: String,
    task: JoinHandle<RunReport>,
    runs: StatusTable,
}

impl RunHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> RunReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(run_id = %self.id, error = %e, "run task failed");
                self.runs.lock().insert(self.id.clone(), RunStatus::Failed);
                RunReport {
                    run_id: self.id,
                    status: RunStatus::Failed,
                    workers: Vec::new(),
                    errors: vec![e.to_string()],
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    settings: EngineSettings,
    store: Arc<dyn LogStore>,
    sink: Arc<dyn RealtimeSink>,
    runs: StatusTable,
    client: ClientFactory,
}

impl Coordinator {
    pub fn new(settings: EngineSettings, store: Arc<dyn LogStore>, sink: Arc<dyn RealtimeSink>) -> Self {
        Self {
            settings,
            store,
            sink,
            runs: Arc::default(),
            client: Arc::new(|_: usize| Runner::build_client()),
        }
    }

    /// Replaces how each worker builds its HTTP client, e.g. to set a proxy.
    pub fn with_client_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(usize) -> reqwest::Result<Client> + Send + Sync + 'static,
    {
        self.client = Arc::new(factory);
        self
    }

    pub fn status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs.lock().get(run_id).copied()
    }

    /// Drops a finished run from the status table. Pending and running runs are kept.
    pub fn forget(&self, run_id: &str) -> Option<RunStatus> {
        let mut runs = self.runs.lock();
        match runs.get(run_id) {
            Some(RunStatus::Completed | RunStatus::Failed) => runs.remove(run_id),
            _ => None,
        }
    }

    fn set_status(&self, run_id: &str, status: RunStatus) {
        self.runs.lock().insert(run_id.to_string(), status);
    }

    /// Validates and starts a run. Must be called from within a tokio runtime;
    /// returns as soon as the run is accepted.
    pub fn run(&self, flow: Flow, config: RunConfig) -> Result<RunHandle, ConfigError> {
        config.validate(&self.settings.limits)?;
        if flow.sequence.is_empty() {
            return Err(ConfigError::EmptyFlow);
        }

        let run_id = Uuid::new_v4().to_string();
        self.set_status(&run_id, RunStatus::Pending);
        let assignments = plan(&run_id, &flow, &config);
        tracing::info!(
            run_id = %run_id,
            ccu = config.ccu,
            threads = config.threads,
            duration = config.duration,
            "run accepted"
        );

        let arbiter = CredentialArbiter::new(config.credentials, config.ccu);
        let task = tokio::spawn(self.clone().execute(run_id.clone(), assignments, arbiter));
        Ok(RunHandle {
            id: run_id,
            task,
            runs: self.runs.clone(),
        })
    }

    async fn execute(
        self,
        run_id: String,
        assignments: Vec<WorkerAssignment>,
        arbiter: CredentialArbiter,
    ) -> RunReport {
        let (tx, mut rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let expected = assignments.len();

        let mut handles = Vec::with_capacity(expected);
        let mut errors = Vec::new();
        for assignment in assignments {
            let worker_id = assignment.worker_id;
            let pool = arbiter.pool(assignment.credentials_share.clone());
            let worker = Worker::new(assignment, pool, tx.clone(), self.settings.clone())
                .with_client_factory(self.client.clone());
            match worker.spawn() {
                Ok(handle) => handles.push((worker_id, handle)),
                Err(e) => {
                    tracing::error!(run_id = %run_id, worker_id, error = %e, "failed to spawn worker");
                    errors.push(format!("Worker {worker_id} failed to start: {e}"));
                }
            }
        }
        drop(tx);
        self.set_status(&run_id, RunStatus::Running);

        let mut emitter =
            BufferedEmitter::new(run_id.clone(), self.sink.clone(), self.settings.sink_batch_size);
        let mut ticker = tokio::time::interval(self.settings.sink_flush_interval());
        ticker.tick().await;
        let mut summaries = Vec::with_capacity(expected);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(WorkerMessage::Log(record)) => {
                        if let Err(e) = self.store.insert_log(&record).await {
                            tracing::warn!(run_id = %run_id, error = %e, "failed to persist log");
                        }
                        emitter.push(record);
                    }
                    Some(WorkerMessage::Info(notice)) => {
                        tracing::info!(run_id = %run_id, "{}", notice.message);
                    }
                    Some(WorkerMessage::Error(notice)) => {
                        tracing::error!(run_id = %run_id, "{}", notice.message);
                        errors.push(notice.message);
                    }
                    Some(WorkerMessage::Done(summary)) => {
                        tracing::info!(run_id = %run_id, "{}", summary.message);
                        summaries.push(summary);
                    }
                    None => break,
                },
                _ = ticker.tick() => emitter.flush(),
            }
        }

        // every sender is gone, so the threads are on their way out
        let exits = join_all(handles.into_iter().map(|(worker_id, handle)| async move {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            let clean = matches!(joined, Ok(Ok(Ok(_))));
            if !clean {
                tracing::error!(worker_id, "worker exited abnormally");
            }
            (worker_id, clean)
        }))
        .await;

        let all_clean = exits.iter().all(|(_, clean)| *clean);
        let status = if exits.len() == expected && all_clean && summaries.len() == expected {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        if let Err(e) = self.store.flush().await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to flush log store");
        }

        summaries.sort_by_key(|s| s.worker_id);
        let report = RunReport {
            run_id: run_id.clone(),
            status,
            workers: summaries,
            errors,
        };
        let message = match status {
            RunStatus::Completed => format!(
                "Run {run_id} completed: {} requests, {} errors",
                report.total_requests(),
                report.total_errors()
            ),
            _ => format!("Run {run_id} failed"),
        };
        emitter.finish(&message);
        self.set_status(&run_id, status);
        tracing::info!(run_id = %run_id, status = ?status, "run finished");
        report
    }
}
