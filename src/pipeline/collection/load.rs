use futures_util::future::BoxFuture;
use tracing::trace;

use crate::pipeline::collection::{next_event, StageEvent};
use crate::pipeline::stage::StageContext;
use crate::types::error::{is_cancelled_error, ObjectError};

enum LoadKind {
    Meta,
    Data,
    Acl,
}

async fn run_loader(ctx: StageContext, kind: LoadKind) {
    loop {
        match next_event(&ctx).await {
            StageEvent::Object(mut object) => {
                let result = match kind {
                    LoadKind::Meta => ctx.group.source.get_object_meta(&mut object).await,
                    LoadKind::Data => ctx.group.source.get_object_content(&mut object).await,
                    LoadKind::Acl => ctx.group.source.get_object_acl(&mut object).await,
                };

                match result {
                    Ok(()) => {
                        if !ctx.send(object).await {
                            return;
                        }
                    }
                    Err(e) if is_cancelled_error(&e) => {
                        ctx.send_error(e).await;
                        return;
                    }
                    Err(e) => {
                        ctx.send_error(
                            ObjectError::new(&object.key, object.version_id.clone(), e).into(),
                        )
                        .await;
                    }
                }
            }
            StageEvent::Closed => {
                trace!(stage = ctx.name(), "loader has been completed.");
                return;
            }
            StageEvent::Cancelled => {
                trace!(stage = ctx.name(), "loader has been cancelled.");
                return;
            }
        }
    }
}

/// Populate metadata-only fields from the source.
pub fn load_object_meta(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move { run_loader(ctx, LoadKind::Meta).await })
}

/// Populate content and all metadata from the source.
pub fn load_object_data(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move { run_loader(ctx, LoadKind::Data).await })
}

/// Populate the explicit access control policy from the source.
pub fn load_object_acl(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move { run_loader(ctx, LoadKind::Acl).await })
}
