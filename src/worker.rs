//! Durable scheduler worker loop.
//!
//! Each worker claims one due instance at a time under a time-bounded lease,
//! runs exactly one leaf step, commits the outcome, and releases the lease as
//! part of the status update. A worker that dies mid-step simply lets its
//! lease expire; another worker re-claims the instance and the incremented
//! attempt counter records the retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::blackboard::apply_patches;
use crate::definition::Node;
use crate::executor::{ExecutionContext, HTTP_TIMEOUT, StepResult, execute};
use crate::interpreter::{NextStep, find_next, is_complete};
use crate::store::{InstanceRow, InstanceStatus, StepStatus, Store};

pub const DEFAULT_LEASE_MS: i64 = 30_000;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: i64 = 1_000;

const IDLE_MIN: Duration = Duration::from_millis(100);
const IDLE_MAX: Duration = Duration::from_secs(5);
const IDLE_JITTER_MS: u64 = 500;
const IDLE_EMPTY: Duration = Duration::from_secs(1);
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Tunables for a worker loop.
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub lease_ms: i64,
    pub max_attempts: i32,
    pub backoff_base_ms: i64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            lease_ms: DEFAULT_LEASE_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

/// Exponential backoff delay for a failed attempt: `base * 2^(attempt - 1)`.
pub(crate) fn retry_backoff_ms(base_ms: i64, attempt: i32) -> i64 {
    if base_ms <= 0 {
        return 0;
    }
    let exponent = (attempt - 1).clamp(0, 30) as u32;
    base_ms.saturating_mul(1_i64 << exponent)
}

pub struct Worker {
    store: Store,
    http: reqwest::Client,
    worker_id: String,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(store: Store, options: WorkerOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("build http client")?;
        let worker_id = format!(
            "worker-{}-{}",
            std::process::id(),
            Utc::now().timestamp_millis()
        );
        Ok(Self {
            store,
            http,
            worker_id,
            options,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until the stop flag is set. Loop-level errors are contained here:
    /// logged, short pause, keep going; a held lease expires on its own.
    pub async fn run(&self, stop: Arc<AtomicBool>, stop_notify: Arc<Notify>) {
        info!(worker_id = %self.worker_id, "worker loop started");
        while !stop.load(Ordering::SeqCst) {
            let pause = match self.tick().await {
                Ok(pause) => pause,
                Err(err) => {
                    warn!(worker_id = %self.worker_id, error = %format!("{err:#}"), "worker tick failed");
                    Some(ERROR_PAUSE)
                }
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = stop_notify.notified() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        info!(worker_id = %self.worker_id, "worker loop exiting");
    }

    /// One scheduling cycle: claim and run a single step if any instance is
    /// due. Returns how long to pause before the next cycle (`None` when a
    /// step ran and more work may be immediately available).
    pub async fn tick(&self) -> Result<Option<Duration>> {
        let lease = ChronoDuration::milliseconds(self.options.lease_ms);
        let Some(instance) = self.store.claim_next(&self.worker_id, lease).await? else {
            return Ok(Some(self.idle_pause().await?));
        };
        self.run_claimed(instance).await?;
        Ok(None)
    }

    async fn run_claimed(&self, instance: InstanceRow) -> Result<()> {
        let instance_id = instance.id;

        let Some(definition) = self.store.get_definition(instance.definition_id).await? else {
            warn!(
                instance_id = %instance_id,
                definition_id = %instance.definition_id,
                "definition missing; failing instance"
            );
            self.store
                .update_instance_status(instance_id, InstanceStatus::Failed, None)
                .await?;
            return Ok(());
        };
        let root: Node = match serde_json::from_value(definition.definition_json.clone()) {
            Ok(root) => root,
            Err(err) => {
                warn!(
                    instance_id = %instance_id,
                    definition = %definition.name,
                    error = %err,
                    "definition tree failed to parse; failing instance"
                );
                self.store
                    .update_instance_status(instance_id, InstanceStatus::Failed, None)
                    .await?;
                return Ok(());
            }
        };

        let mut statuses: HashMap<String, StepStatus> = self
            .store
            .list_steps(instance_id)
            .await?
            .into_iter()
            .map(|step| (step.node_id, step.status))
            .collect();
        let mut blackboard = instance.blackboard;

        if is_complete(&root, &statuses, &blackboard, "") {
            info!(instance_id = %instance_id, "instance complete");
            self.store
                .update_instance_status(instance_id, InstanceStatus::Completed, None)
                .await?;
            return Ok(());
        }
        let Some(NextStep {
            node,
            effective_id,
            scoped_blackboard,
        }) = find_next(&root, &statuses, &blackboard, "")
        else {
            info!(instance_id = %instance_id, "instance complete");
            self.store
                .update_instance_status(instance_id, InstanceStatus::Completed, None)
                .await?;
            return Ok(());
        };

        let step = self.store.get_or_create_step(instance_id, &effective_id).await?;
        if step.status == StepStatus::Succeeded {
            // Another worker committed this step between our load and now.
            debug!(
                instance_id = %instance_id,
                step = %effective_id,
                "step already succeeded; releasing lease"
            );
            self.store.release_instance_lease(instance_id).await?;
            return Ok(());
        }
        let attempt = self
            .store
            .increment_step_attempts(instance_id, &effective_id)
            .await?;

        debug!(
            instance_id = %instance_id,
            step = %effective_id,
            kind = node.kind_str(),
            attempt,
            "executing step"
        );
        let ctx = ExecutionContext {
            store: &self.store,
            http: &self.http,
            attempt,
        };
        let result = execute(node, &scoped_blackboard, &ctx).await;
        let now = Utc::now();

        match result {
            StepResult::Success { patches } => {
                self.persist_patches(instance_id, &mut blackboard, &patches)
                    .await?;
                let output = output_payload(&patches)?;
                self.store
                    .update_step_success(instance_id, &effective_id, output)
                    .await?;
                statuses.insert(effective_id.clone(), StepStatus::Succeeded);
                if is_complete(&root, &statuses, &blackboard, "") {
                    info!(instance_id = %instance_id, "instance complete");
                    self.store
                        .update_instance_status(instance_id, InstanceStatus::Completed, None)
                        .await?;
                } else {
                    self.store
                        .update_instance_status(instance_id, InstanceStatus::Runnable, Some(now))
                        .await?;
                }
            }
            StepResult::Wait {
                next_run_at,
                patches,
            } => {
                self.persist_patches(instance_id, &mut blackboard, &patches)
                    .await?;
                // The scheduling commitment is what is durable: the step is
                // done, the instance is simply not due yet.
                self.store
                    .update_step_success(instance_id, &effective_id, None)
                    .await?;
                debug!(
                    instance_id = %instance_id,
                    step = %effective_id,
                    next_run_at = %next_run_at,
                    "step waiting"
                );
                self.store
                    .update_instance_status(
                        instance_id,
                        InstanceStatus::Runnable,
                        Some(next_run_at),
                    )
                    .await?;
            }
            StepResult::Fail { error, retry_at } => {
                if attempt < self.options.max_attempts {
                    self.store
                        .record_step_failure(instance_id, &effective_id, &error)
                        .await?;
                    let backoff = now
                        + ChronoDuration::milliseconds(retry_backoff_ms(
                            self.options.backoff_base_ms,
                            attempt,
                        ));
                    let next_run = retry_at.map_or(backoff, |at| at.max(backoff));
                    warn!(
                        instance_id = %instance_id,
                        step = %effective_id,
                        attempt,
                        error = %error,
                        next_run_at = %next_run,
                        "step failed; will retry"
                    );
                    self.store
                        .update_instance_status(
                            instance_id,
                            InstanceStatus::Runnable,
                            Some(next_run),
                        )
                        .await?;
                } else {
                    warn!(
                        instance_id = %instance_id,
                        step = %effective_id,
                        attempt,
                        error = %error,
                        "step failed; retries exhausted"
                    );
                    self.store
                        .update_step_failed(instance_id, &effective_id, &error)
                        .await?;
                    self.store
                        .update_instance_status(instance_id, InstanceStatus::Failed, None)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn persist_patches(
        &self,
        instance_id: uuid::Uuid,
        blackboard: &mut Value,
        patches: &[crate::definition::Patch],
    ) -> Result<()> {
        if patches.is_empty() {
            return Ok(());
        }
        apply_patches(blackboard, patches);
        self.store
            .update_instance_blackboard(instance_id, blackboard)
            .await?;
        Ok(())
    }

    async fn idle_pause(&self) -> Result<Duration> {
        let Some(next_run) = self.store.get_next_run_time().await? else {
            return Ok(IDLE_EMPTY);
        };
        let until = (next_run - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=IDLE_JITTER_MS));
        Ok(until.clamp(IDLE_MIN, IDLE_MAX) + jitter)
    }
}

/// Opaque success payload for the step row: the patch list the step produced.
fn output_payload(patches: &[crate::definition::Patch]) -> Result<Option<Value>> {
    if patches.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_value(patches)?))
}
