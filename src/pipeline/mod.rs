//! The pipeline engine: an ordered list of stages, each with its own worker
//! pool and bounded queues, sharing one source and one target backend.
//!
//! Counting happens on dedicated forwarding tasks so the worker path never
//! contends on it. Every error a stage emits is wrapped into a
//! [`PipelineError`] and forwarded to the aggregate error stream; when the
//! pipeline reaches a terminal state, the stream emits a single `None`
//! sentinel and closes.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Error;
use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::pipeline::stage::{
    GroupHandle, Stage, StageContext, StageInfo, StageState, StageStats,
};
use crate::storage::Storage;
use crate::types::error::{is_cancelled_error, PipelineError};
use crate::types::token::PipelineCancellationToken;
use crate::types::Object;

pub mod collection;
pub mod stage;

/// An ordered list of stages plus the source and target backends they run
/// against. Build it up, then [`Group::run`] it exactly once.
pub struct Group {
    source: Option<Storage>,
    target: Option<Storage>,
    stages: Vec<Stage>,
    cancellation_token: PipelineCancellationToken,
}

impl Group {
    pub fn new(cancellation_token: PipelineCancellationToken) -> Self {
        Self {
            source: None,
            target: None,
            stages: Vec::new(),
            cancellation_token,
        }
    }

    pub fn set_source(&mut self, storage: Storage) {
        self.source = Some(storage);
    }

    pub fn set_target(&mut self, storage: Storage) {
        self.target = Some(storage);
    }

    /// Append a stage. Stages execute in order of addition.
    pub fn add_stage(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Spawn every forwarder and worker and return immediately. The caller
    /// must read the aggregate error stream to the sentinel, even after
    /// cancelling, or shutdown stalls on undelivered errors.
    pub fn run(self) -> RunningGroup {
        let states = self
            .stages
            .iter()
            .map(|stage| StageState {
                name: stage.name.clone(),
                config: stage.config.clone(),
                stats: StageStats::default(),
            })
            .collect();

        let handle = Arc::new(GroupHandle {
            source: self.source.expect("source storage must be set"),
            target: self.target.expect("target storage must be set"),
            stages: states,
            cancellation_token: self.cancellation_token,
        });

        let (aggregate_tx, aggregate_rx) = async_channel::unbounded::<Option<PipelineError>>();

        let mut previous_external_output: Option<Receiver<Object>> = None;
        let mut error_forwarders = Vec::new();
        let mut last_stage_workers: Option<JoinHandle<()>> = None;

        for (index, stage) in self.stages.into_iter().enumerate() {
            let (internal_out_tx, internal_out_rx) =
                async_channel::bounded::<Object>(stage.chan_size.max(1));
            let (external_out_tx, external_out_rx) = async_channel::bounded::<Object>(1);
            let (stage_err_tx, stage_err_rx) = async_channel::unbounded::<Error>();

            error_forwarders.push(tokio::spawn(forward_errors(
                handle.clone(),
                index,
                stage_err_rx,
                aggregate_tx.clone(),
            )));

            tokio::spawn(forward_output(
                handle.clone(),
                index,
                internal_out_rx,
                external_out_tx,
            ));

            let worker_input = match previous_external_output.take() {
                Some(upstream) => {
                    let (internal_in_tx, internal_in_rx) = async_channel::bounded::<Object>(1);
                    tokio::spawn(forward_input(
                        handle.clone(),
                        index,
                        upstream,
                        internal_in_tx,
                    ));
                    Some(internal_in_rx)
                }
                None => None,
            };

            let mut workers = Vec::with_capacity(1 + stage.add_workers as usize);
            for _ in 0..=stage.add_workers {
                let context = StageContext {
                    group: handle.clone(),
                    stage_index: index,
                    input: worker_input.clone(),
                    output: internal_out_tx.clone(),
                    errors: stage_err_tx.clone(),
                };
                workers.push(tokio::spawn((stage.func)(context)));
            }

            // the engine's clones go away here, so the stage's output and
            // error channels close as soon as the last worker returns
            drop(internal_out_tx);
            drop(stage_err_tx);

            let stage_name = stage.name;
            last_stage_workers = Some(tokio::spawn(async move {
                for worker in workers {
                    let _ = worker.await;
                }
                trace!(stage = stage_name, "pipeline stage finished.");
            }));

            previous_external_output = Some(external_out_rx);
        }

        tokio::spawn(async move {
            if let Some(workers) = last_stage_workers {
                let _ = workers.await;
            }
            for forwarder in error_forwarders {
                let _ = forwarder.await;
            }
            trace!("all pipeline stages finished.");

            let _ = aggregate_tx.send(None).await;
            aggregate_tx.close();
        });

        RunningGroup {
            handle,
            errors: aggregate_rx,
        }
    }
}

/// Handle to a started pipeline: the aggregate error stream plus stage
/// introspection for progress reporting.
pub struct RunningGroup {
    handle: Arc<GroupHandle>,
    errors: Receiver<Option<PipelineError>>,
}

impl RunningGroup {
    /// The aggregate error stream. A `None` marks the terminal state; the
    /// channel closes right after it.
    pub fn errors(&self) -> Receiver<Option<PipelineError>> {
        self.errors.clone()
    }

    pub fn cancellation_token(&self) -> PipelineCancellationToken {
        self.handle.cancellation_token.clone()
    }

    pub fn stage_info(&self, index: usize) -> StageInfo {
        let state = &self.handle.stages[index];
        StageInfo {
            name: state.name.clone(),
            index,
            stats: state.stats.snapshot(),
            config: state.config.clone(),
        }
    }

    pub fn all_stage_info(&self) -> Vec<StageInfo> {
        (0..self.handle.stages.len())
            .map(|index| self.stage_info(index))
            .collect()
    }
}

async fn forward_errors(
    handle: Arc<GroupHandle>,
    stage_index: usize,
    stage_errors: Receiver<Error>,
    aggregate: Sender<Option<PipelineError>>,
) {
    let mut forwarding = true;

    while let Ok(e) = stage_errors.recv().await {
        if is_cancelled_error(&e) {
            trace!(
                stage = handle.stages[stage_index].name,
                "cancellation reported. not forwarded."
            );
            continue;
        }

        handle.stages[stage_index]
            .stats
            .error
            .fetch_add(1, Ordering::Relaxed);

        if forwarding {
            let wrapped = PipelineError {
                stage_name: handle.stages[stage_index].name.clone(),
                stage_index,
                cause: e,
            };
            // if the driver stopped reading we still drain, so workers
            // never block on error emission
            forwarding = aggregate.send(Some(wrapped)).await.is_ok();
        }
    }
}

async fn forward_output(
    handle: Arc<GroupHandle>,
    stage_index: usize,
    internal_output: Receiver<Object>,
    external_output: Sender<Object>,
) {
    while let Ok(object) = internal_output.recv().await {
        handle.stages[stage_index]
            .stats
            .output
            .fetch_add(1, Ordering::Relaxed);

        if external_output.send(object).await.is_err() {
            // downstream is gone; drain so this stage's workers can finish
            while internal_output.recv().await.is_ok() {}
            return;
        }
    }
}

async fn forward_input(
    handle: Arc<GroupHandle>,
    stage_index: usize,
    upstream: Receiver<Object>,
    internal_input: Sender<Object>,
) {
    while let Ok(object) = upstream.recv().await {
        handle.stages[stage_index]
            .stats
            .input
            .fetch_add(1, Ordering::Relaxed);

        if internal_input.send(object).await.is_err() {
            while upstream.recv().await.is_ok() {}
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::StageConfig;
    use crate::storage::StorageTrait;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use futures_util::future::BoxFuture;
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone)]
    struct NullStorage {}

    #[async_trait]
    impl StorageTrait for NullStorage {
        fn with_cancellation_token(
            &mut self,
            _token: crate::types::token::PipelineCancellationToken,
        ) {
        }

        fn with_rate_limit(&mut self, _bytes_per_sec: u32) -> anyhow::Result<()> {
            Ok(())
        }

        async fn list(&self, _sender: &async_channel::Sender<Object>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_object_meta(&self, _object: &mut Object) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_object_acl(&self, _object: &mut Object) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_object_content(&self, _object: &mut Object) -> anyhow::Result<()> {
            Ok(())
        }

        async fn put_object(&self, _object: &mut Object) -> anyhow::Result<()> {
            Ok(())
        }

        async fn delete_object(&self, _object: &Object) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn produce_100(ctx: StageContext) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            for i in 0..100 {
                if !ctx.send(Object::with_key(&format!("key-{i}"))).await {
                    return;
                }
            }
        })
    }

    fn produce_forever(ctx: StageContext) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut i: u64 = 0;
            loop {
                if ctx.group.cancellation_token.is_cancelled() {
                    let _ = ctx
                        .errors
                        .send(crate::types::error::SyncError::Cancelled.into())
                        .await;
                    return;
                }
                if !ctx.send(Object::with_key(&format!("key-{i}"))).await {
                    return;
                }
                i += 1;
            }
        })
    }

    fn passthrough(ctx: StageContext) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let input = ctx.input.clone().unwrap();
            while let Ok(object) = input.recv().await {
                if !ctx.send(object).await {
                    return;
                }
            }
        })
    }

    fn failing(ctx: StageContext) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let input = ctx.input.clone().unwrap();
            while let Ok(object) = input.recv().await {
                ctx.send_error(anyhow!("cannot process {}", object.key)).await;
            }
        })
    }

    fn requires_extensions(ctx: StageContext) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if !matches!(ctx.config(), StageConfig::Extensions(_)) {
                ctx.send_config_error(None).await;
            }
        })
    }

    fn drain(ctx: StageContext) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let input = ctx.input.clone().unwrap();
            while input.recv().await.is_ok() {}
        })
    }

    fn build_group() -> Group {
        let mut group = Group::new(crate::types::token::create_pipeline_cancellation_token());
        group.set_source(Box::new(NullStorage {}));
        group.set_target(Box::new(NullStorage {}));
        group
    }

    async fn drain_to_sentinel(running: &RunningGroup) -> Vec<PipelineError> {
        let errors = running.errors();
        let mut collected = vec![];
        while let Ok(event) = errors.recv().await {
            match event {
                Some(e) => collected.push(e),
                None => break,
            }
        }
        // after the sentinel the stream is closed
        assert!(errors.recv().await.is_err());
        collected
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn counters_match_across_adjacent_stages() {
        init_dummy_tracing_subscriber();

        let mut group = build_group();
        group.add_stage(Stage::new("Produce", produce_100).with_chan_size(10));
        group.add_stage(Stage::new("Pass", passthrough).with_workers(3));
        group.add_stage(Stage::new("Terminator", drain));

        let running = group.run();
        let errors = drain_to_sentinel(&running).await;
        assert!(errors.is_empty());

        let info = running.all_stage_info();
        assert_eq!(info[0].stats.output, 100);
        assert_eq!(info[1].stats.input, 100);
        assert_eq!(info[1].stats.output, 100);
        assert_eq!(info[2].stats.input, 100);
        assert_eq!(info[2].stats.output, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stage_errors_are_wrapped_and_counted() {
        init_dummy_tracing_subscriber();

        let mut group = build_group();
        group.add_stage(Stage::new("Produce", produce_100).with_chan_size(10));
        group.add_stage(Stage::new("Fail", failing));

        let running = group.run();
        let errors = drain_to_sentinel(&running).await;

        assert_eq!(errors.len(), 100);
        assert_eq!(errors[0].stage_name, "Fail");
        assert_eq!(errors[0].stage_index, 1);

        let info = running.stage_info(1);
        assert_eq!(info.stats.input, 100);
        assert_eq!(info.stats.error, 100);
        assert_eq!(info.stats.output, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn configuration_error_reaches_the_stream() {
        init_dummy_tracing_subscriber();

        let mut group = build_group();
        group.add_stage(Stage::new("Produce", produce_100));
        group.add_stage(
            Stage::new("NeedsConfig", requires_extensions).with_config(StageConfig::Timestamp(0)),
        );

        let running = group.run();
        let errors = drain_to_sentinel(&running).await;

        assert!(!errors.is_empty());
        assert!(errors[0]
            .cause
            .downcast_ref::<crate::types::error::StepConfigurationError>()
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_terminates_in_bounded_time() {
        init_dummy_tracing_subscriber();

        let mut group = build_group();
        group.add_stage(Stage::new("Produce", produce_forever).with_chan_size(10));
        group.add_stage(Stage::new("Pass", passthrough).with_workers(2));
        group.add_stage(Stage::new("Terminator", drain));

        let running = group.run();
        let token = running.cancellation_token();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let errors = tokio::time::timeout(
            Duration::from_secs(5),
            drain_to_sentinel(&running),
        )
        .await
        .expect("pipeline must terminate after cancellation");

        // cancellation errors are suppressed, not forwarded
        assert!(errors.is_empty());
        assert_eq!(running.stage_info(0).stats.error, 0);
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .or_else(|_| EnvFilter::try_new("dummy=trace"))
                    .unwrap(),
            )
            .try_init();
    }
}
