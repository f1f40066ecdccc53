use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Error;
use async_channel::{Receiver, Sender};
use futures_util::future::BoxFuture;

use crate::storage::Storage;
use crate::types::error::StepConfigurationError;
use crate::types::token::PipelineCancellationToken;
use crate::types::Object;

/// A stage function: the unit of work the engine runs `1 + add_workers`
/// times. Stage 0 is the producer and receives no input queue.
pub type StageFn = fn(StageContext) -> BoxFuture<'static, ()>;

/// Configuration carried through the homogeneous stage list. Every stage
/// validates the variant it expects on entry and reports a
/// [`StepConfigurationError`] on mismatch.
#[derive(Debug, Clone, PartialEq)]
pub enum StageConfig {
    None,
    Extensions(Vec<String>),
    ContentTypes(Vec<String>),
    Timestamp(i64),
    Acl(String),
    StorageClass(String),
    CacheControl(String),
    ObjectsPerSec(u32),
}

/// One step of the pipeline as the caller describes it: a name, the
/// function, extra workers beyond the baseline one, its configuration and
/// the capacity of its internal output queue.
pub struct Stage {
    pub name: String,
    pub func: StageFn,
    pub add_workers: u16,
    pub config: StageConfig,
    pub chan_size: usize,
}

impl Stage {
    pub fn new(name: &str, func: StageFn) -> Self {
        Self {
            name: name.to_string(),
            func,
            add_workers: 0,
            config: StageConfig::None,
            chan_size: 0,
        }
    }

    pub fn with_workers(mut self, add_workers: u16) -> Self {
        self.add_workers = add_workers;
        self
    }

    pub fn with_config(mut self, config: StageConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_chan_size(mut self, chan_size: usize) -> Self {
        self.chan_size = chan_size;
        self
    }
}

/// Per-stage counters. Increments happen on the forwarding paths; readers
/// take single-word snapshots with no cross-counter consistency.
#[derive(Debug, Default)]
pub struct StageStats {
    pub input: AtomicU64,
    pub output: AtomicU64,
    pub error: AtomicU64,
}

impl StageStats {
    pub fn snapshot(&self) -> StageStatsSnapshot {
        StageStatsSnapshot {
            input: self.input.load(Ordering::Relaxed),
            output: self.output.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageStatsSnapshot {
    pub input: u64,
    pub output: u64,
    pub error: u64,
}

/// Stage metadata shared with every worker through the group handle.
pub struct StageState {
    pub name: String,
    pub config: StageConfig,
    pub stats: StageStats,
}

/// The running group as stage functions see it: both backends, every
/// stage's metadata and counters, and the cancellation scope.
pub struct GroupHandle {
    pub source: Storage,
    pub target: Storage,
    pub stages: Vec<StageState>,
    pub cancellation_token: PipelineCancellationToken,
}

/// Everything one worker needs: the group handle, its stage index and the
/// queues wired up by the engine.
pub struct StageContext {
    pub group: Arc<GroupHandle>,
    pub stage_index: usize,
    pub input: Option<Receiver<Object>>,
    pub output: Sender<Object>,
    pub errors: Sender<Error>,
}

impl StageContext {
    pub fn name(&self) -> &str {
        &self.group.stages[self.stage_index].name
    }

    pub fn config(&self) -> &StageConfig {
        &self.group.stages[self.stage_index].config
    }

    /// Send to the next stage. Returns `false` when the pipeline is shutting
    /// down and the object can no longer be delivered.
    pub async fn send(&self, object: Object) -> bool {
        self.output.send(object).await.is_ok()
    }

    pub async fn send_error(&self, e: Error) {
        let _ = self.errors.send(e).await;
    }

    pub async fn send_config_error(&self, cause: Option<Error>) {
        let error = match cause {
            Some(cause) => {
                StepConfigurationError::with_cause(self.name(), self.stage_index, cause)
            }
            None => StepConfigurationError::new(self.name(), self.stage_index),
        };

        let _ = self.errors.send(error.into()).await;
    }
}

/// Atomic-snapshot view of one stage, for progress reporting.
#[derive(Debug, Clone)]
pub struct StageInfo {
    pub name: String,
    pub index: usize,
    pub stats: StageStatsSnapshot,
    pub config: StageConfig,
}
