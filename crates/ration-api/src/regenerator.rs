//! Single-writer background regeneration.
//!
//! Front ends never run the engine inline. They enqueue a trigger and return;
//! one worker task drains every queued job before each run, so a burst of
//! mutations collapses into a single regeneration, and runs never overlap.
//! Standalone attribution requests go through the same queue, so they never
//! write attributions against a plan a concurrent run just replaced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use ration_core::AttributionOutcome;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use crate::RationApi;

enum Job {
    Regenerate(String),
    Attribute(oneshot::Sender<Result<AttributionOutcome>>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegenerationStatus {
    pub completed_runs: u64,
    pub failed_runs: u64,
    /// Every trigger taken off the queue, coalesced ones included.
    pub handled_triggers: u64,
    /// Triggers absorbed into a run that another trigger had already started.
    pub coalesced_triggers: u64,
    pub attribution_runs: u64,
    pub last_reason: Option<String>,
    pub last_plan_id: Option<String>,
    pub last_error: Option<String>,
}

impl RegenerationStatus {
    #[must_use]
    pub fn finished_runs(&self) -> u64 {
        self.completed_runs + self.failed_runs
    }
}

#[derive(Debug, Clone)]
pub struct RegenerationHandle {
    sender: mpsc::UnboundedSender<Job>,
    status: watch::Receiver<RegenerationStatus>,
    sent: Arc<AtomicU64>,
}

impl RegenerationHandle {
    /// Queue a regeneration. Never blocks.
    ///
    /// # Errors
    /// Returns an error when the worker task has stopped.
    pub fn trigger(&self, reason: impl Into<String>) -> Result<()> {
        self.sender
            .send(Job::Regenerate(reason.into()))
            .map_err(|_| anyhow!("regeneration worker is no longer running"))?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Attribute pending recipients to the current plan on the worker task.
    ///
    /// Runs after every regeneration queued before it.
    ///
    /// # Errors
    /// Returns an error when the worker has stopped, no plan exists yet, or
    /// loading or persistence fails.
    pub async fn attribute(&self) -> Result<AttributionOutcome> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Job::Attribute(reply))
            .map_err(|_| anyhow!("regeneration worker is no longer running"))?;
        response.await.map_err(|_| anyhow!("regeneration worker dropped the attribution request"))?
    }

    #[must_use]
    pub fn status(&self) -> RegenerationStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RegenerationStatus> {
        self.status.clone()
    }

    /// Wait until at least `runs` regenerations have finished, successfully or not.
    ///
    /// # Errors
    /// Returns an error when the worker stops before reaching `runs`.
    pub async fn wait_for_runs(&self, runs: u64) -> Result<RegenerationStatus> {
        let mut receiver = self.status.clone();
        let status = receiver
            .wait_for(|status| status.finished_runs() >= runs)
            .await
            .map_err(|_| anyhow!("regeneration worker stopped before finishing {runs} runs"))?;
        Ok(status.clone())
    }

    /// Wait until every trigger sent so far through any clone of this handle
    /// has been handled by a finished run.
    ///
    /// # Errors
    /// Returns an error when the worker stops first.
    pub async fn wait_until_idle(&self) -> Result<RegenerationStatus> {
        let target = self.sent.load(Ordering::SeqCst);
        let mut receiver = self.status.clone();
        let status = receiver
            .wait_for(|status| status.handled_triggers >= target)
            .await
            .map_err(|_| anyhow!("regeneration worker stopped with triggers still queued"))?;
        Ok(status.clone())
    }
}

pub struct Regenerator;

impl Regenerator {
    /// Start the worker on the current tokio runtime.
    #[must_use]
    pub fn spawn(api: RationApi) -> RegenerationHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RegenerationStatus::default());
        tokio::spawn(run_worker(api, receiver, status_tx));
        RegenerationHandle { sender, status: status_rx, sent: Arc::new(AtomicU64::new(0)) }
    }
}

async fn run_worker(
    api: RationApi,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    status: watch::Sender<RegenerationStatus>,
) {
    while let Some(job) = receiver.recv().await {
        let mut jobs = vec![job];
        while let Ok(next) = receiver.try_recv() {
            jobs.push(next);
        }

        let mut reasons = Vec::new();
        let mut waiters = Vec::new();
        for job in jobs {
            match job {
                Job::Regenerate(reason) => reasons.push(reason),
                Job::Attribute(reply) => waiters.push(reply),
            }
        }

        if let Some(reason) = reasons.pop() {
            regenerate_once(&api, reason, reasons.len() as u64, &status).await;
        }
        for reply in waiters {
            attribute_once(&api, reply, &status).await;
        }
    }
    debug!("regeneration worker stopped");
}

async fn regenerate_once(
    api: &RationApi,
    reason: String,
    coalesced: u64,
    status: &watch::Sender<RegenerationStatus>,
) {
    if coalesced > 0 {
        debug!(coalesced, "coalesced queued regeneration triggers");
    }

    let worker_api = api.clone();
    let outcome = tokio::task::spawn_blocking(move || worker_api.regenerate()).await;

    status.send_modify(|status| {
        status.handled_triggers += 1 + coalesced;
        status.coalesced_triggers += coalesced;
        status.last_reason = Some(reason.clone());
        match outcome {
            Ok(Ok(result)) => {
                info!(reason = %reason, plan_id = %result.plan.plan_id, "regeneration finished");
                status.completed_runs += 1;
                status.last_plan_id = Some(result.plan.plan_id);
                status.last_error = None;
            }
            Ok(Err(err)) => {
                error!(reason = %reason, error = %format!("{err:#}"), "regeneration failed");
                status.failed_runs += 1;
                status.last_error = Some(format!("{err:#}"));
            }
            Err(join_err) => {
                error!(reason = %reason, error = %join_err, "regeneration task aborted");
                status.failed_runs += 1;
                status.last_error = Some(format!("regeneration task aborted: {join_err}"));
            }
        }
    });
}

async fn attribute_once(
    api: &RationApi,
    reply: oneshot::Sender<Result<AttributionOutcome>>,
    status: &watch::Sender<RegenerationStatus>,
) {
    let worker_api = api.clone();
    let outcome = match tokio::task::spawn_blocking(move || worker_api.attribute()).await {
        Ok(outcome) => outcome,
        Err(join_err) => Err(anyhow!("attribution task aborted: {join_err}")),
    };
    status.send_modify(|status| status.attribution_runs += 1);
    if reply.send(outcome).is_err() {
        debug!("attribution requester went away before the reply");
    }
}
