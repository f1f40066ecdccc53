use futures_util::future::BoxFuture;
use tracing::{info, trace};

use crate::pipeline::collection::{next_event, StageEvent};
use crate::pipeline::stage::{StageConfig, StageContext};
use crate::storage::build_rate_limiter;

/// Drain the final queue and forward nothing. Every pipeline must end with
/// this stage, otherwise upstream back-pressure deadlocks the run.
pub fn terminator(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        trace!(stage = ctx.name(), "terminator has started.");

        if let Some(input) = ctx.input.as_ref() {
            while input.recv().await.is_ok() {}
        }

        trace!(stage = ctx.name(), "terminator has been completed.");
    })
}

/// Record every passing object and forward it unchanged.
pub fn logger(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if !matches!(ctx.config(), StageConfig::None) {
            ctx.send_config_error(None).await;
            return;
        }

        loop {
            match next_event(&ctx).await {
                StageEvent::Object(object) => {
                    info!(
                        key = object.key,
                        size = object.size(),
                        content_type = object.content_type.as_deref().unwrap_or(""),
                        "object synced."
                    );
                    if !ctx.send(object).await {
                        return;
                    }
                }
                StageEvent::Closed => return,
                StageEvent::Cancelled => return,
            }
        }
    })
}

/// Slow the pipeline down to a configured objects/sec rate by waiting on a
/// token bucket before forwarding each object.
pub fn pipeline_rate_limit(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let &StageConfig::ObjectsPerSec(rate) = ctx.config() else {
            ctx.send_config_error(None).await;
            return;
        };

        let limiter = match build_rate_limiter(rate) {
            Ok(limiter) => limiter,
            Err(e) => {
                ctx.send_config_error(Some(e)).await;
                return;
            }
        };

        loop {
            match next_event(&ctx).await {
                StageEvent::Object(object) => {
                    limiter.acquire(1).await;
                    if !ctx.send(object).await {
                        return;
                    }
                }
                StageEvent::Closed => return,
                StageEvent::Cancelled => return,
            }
        }
    })
}
