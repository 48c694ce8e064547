//! One simulated client looping a flow until its worker's deadline.

use crate::context::Context;
use crate::model::{Credential, LogRecord, WorkerMessage};
use crate::runner::{pause, Outcome, StepResult};
use crate::worker::Shard;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    Spawned,
    Running,
    Thinking,
    Stopped,
}

pub struct VirtualUser {
    index: usize,
    start_delay: Duration,
    shard: Arc<Shard>,
    state: UserState,
    credential: Option<Credential>,
}

impl VirtualUser {
    pub(crate) fn new(index: usize, start_delay: Duration, shard: Arc<Shard>) -> Self {
        Self {
            index,
            start_delay,
            shard,
            state: UserState::Spawned,
            credential: None,
        }
    }

    pub async fn run(mut self) -> UserState {
        let mut ctx = Context::new();
        loop {
            self.state = match self.state {
                UserState::Spawned => self.start(&mut ctx).await,
                UserState::Running => self.iterate(&mut ctx).await,
                UserState::Thinking => self.think().await,
                UserState::Stopped => break,
            };
        }
        if let Some(credential) = self.credential.take() {
            self.shard.pool.release(&credential);
        }
        tracing::debug!(worker_id = self.shard.worker_id, user = self.index, "user stopped");
        self.state
    }

    async fn start(&mut self, ctx: &mut Context) -> UserState {
        if !pause(self.start_delay, &self.shard.cancel).await {
            return UserState::Stopped;
        }
        if !self.shard.pool.is_empty() {
            match self.acquire().await {
                Some(credential) => self.credential = Some(credential),
                None => {
                    let _ = self
                        .shard
                        .tx
                        .send(WorkerMessage::error(format!(
                            "[Worker {}] No credential available for user {}",
                            self.shard.worker_id, self.index
                        )))
                        .await;
                    return UserState::Stopped;
                }
            }
        }
        *ctx = Context::seed(&self.shard.input, self.credential.as_ref());
        UserState::Running
    }

    async fn acquire(&self) -> Option<Credential> {
        for _ in 0..self.shard.settings.credential_attempts.max(1) {
            if let Some(credential) = self.shard.pool.acquire() {
                return Some(credential);
            }
            if !pause(self.shard.settings.credential_wait(), &self.shard.cancel).await {
                return None;
            }
        }
        None
    }

    async fn iterate(&self, ctx: &mut Context) -> UserState {
        let shard = &self.shard;
        for node in &shard.nodes {
            if shard.expired() {
                return UserState::Stopped;
            }
            match shard.runner.run_step(node, ctx, &shard.cancel).await {
                Ok(StepResult::Outcome(outcome)) => {
                    // anything landing after the cutoff is an artifact of it
                    if shard.cancel.is_cancelled() {
                        shard.tally.record_aborted(shard.settings.aborted_requests);
                        return UserState::Stopped;
                    }
                    if !self.report(&node.id, outcome).await {
                        return UserState::Stopped;
                    }
                }
                Ok(StepResult::Aborted) => {
                    shard.tally.record_aborted(shard.settings.aborted_requests);
                    return UserState::Stopped;
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = shard.worker_id,
                        user = self.index,
                        endpoint = %node.id,
                        error = %e,
                        "step failed"
                    );
                    let outcome = Outcome {
                        status_code: shard.settings.transport_error_status,
                        latency_ms: 0,
                        error: Some(e.to_string()),
                    };
                    if !self.report(&node.id, outcome).await {
                        return UserState::Stopped;
                    }
                    return UserState::Thinking;
                }
            }
        }
        UserState::Thinking
    }

    async fn think(&self) -> UserState {
        let shard = &self.shard;
        if shard.expired() || !pause(shard.settings.think_time.sample(), &shard.cancel).await {
            return UserState::Stopped;
        }
        if shard.expired() {
            UserState::Stopped
        } else {
            UserState::Running
        }
    }

    /// Returns `false` once the coordinator is gone.
    async fn report(&self, endpoint_id: &str, outcome: Outcome) -> bool {
        self.shard.tally.record(&outcome);
        let record = LogRecord {
            run_id: self.shard.run_id.clone(),
            endpoint_id: endpoint_id.to_string(),
            status_code: outcome.status_code,
            response_time: outcome.latency_ms,
            error: outcome.error,
            created_at: Utc::now(),
        };
        self.shard.tx.send(WorkerMessage::Log(record)).await.is_ok()
    }
}
