use futures_util::future::BoxFuture;
use tracing::trace;

use crate::pipeline::stage::StageContext;

/// Producer stage: enumerate the source and feed the pipeline. Any listing
/// failure, including cancellation, goes to the stage error channel.
pub fn list_source(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        trace!(stage = ctx.name(), "source listing has started.");

        if let Err(e) = ctx.group.source.list(&ctx.output).await {
            ctx.send_error(e).await;
            return;
        }

        trace!(stage = ctx.name(), "source listing has been completed.");
    })
}
