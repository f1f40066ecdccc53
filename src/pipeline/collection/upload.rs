use futures_util::future::BoxFuture;
use tracing::trace;

use crate::pipeline::collection::{next_event, StageEvent};
use crate::pipeline::stage::StageContext;
use crate::types::error::{is_cancelled_error, ObjectError};

/// Write each incoming object to the target, content and metadata together.
pub fn upload_object_data(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        loop {
            match next_event(&ctx).await {
                StageEvent::Object(mut object) => {
                    match ctx.group.target.put_object(&mut object).await {
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
                                ObjectError::new(&object.key, object.version_id.clone(), e)
                                    .into(),
                            )
                            .await;
                        }
                    }
                }
                StageEvent::Closed => {
                    trace!(stage = ctx.name(), "upload has been completed.");
                    return;
                }
                StageEvent::Cancelled => {
                    trace!(stage = ctx.name(), "upload has been cancelled.");
                    return;
                }
            }
        }
    })
}
