use futures_util::future::BoxFuture;
use tracing::trace;

use crate::pipeline::collection::{next_event, StageEvent};
use crate::pipeline::stage::{StageConfig, StageContext};
use crate::types::Object;

async fn run_updater<F>(ctx: StageContext, update: F)
where
    F: Fn(&mut Object),
{
    loop {
        match next_event(&ctx).await {
            StageEvent::Object(mut object) => {
                update(&mut object);
                if !ctx.send(object).await {
                    return;
                }
            }
            StageEvent::Closed => {
                trace!(stage = ctx.name(), "updater has been completed.");
                return;
            }
            StageEvent::Cancelled => {
                trace!(stage = ctx.name(), "updater has been cancelled.");
                return;
            }
        }
    }
}

/// Overwrite the canned ACL of every passing object. The ACL is a remote
/// store attribute, unrelated to filesystem permissions.
pub fn acl_updater(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let StageConfig::Acl(acl) = ctx.config().clone() else {
            ctx.send_config_error(None).await;
            return;
        };

        run_updater(ctx, move |object| object.acl = Some(acl.clone())).await
    })
}

/// Overwrite the storage class of every passing object.
pub fn storage_class_updater(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let StageConfig::StorageClass(storage_class) = ctx.config().clone() else {
            ctx.send_config_error(None).await;
            return;
        };

        run_updater(ctx, move |object| {
            object.storage_class = Some(storage_class.clone())
        })
        .await
    })
}

/// Overwrite the cache-control header of every passing object.
pub fn cache_control_updater(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let StageConfig::CacheControl(cache_control) = ctx.config().clone() else {
            ctx.send_config_error(None).await;
            return;
        };

        run_updater(ctx, move |object| {
            object.cache_control = Some(cache_control.clone())
        })
        .await
    })
}
