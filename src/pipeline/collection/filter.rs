use std::path::Path;

use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use crate::pipeline::collection::{next_event, StageEvent};
use crate::pipeline::stage::{StageConfig, StageContext};
use crate::storage::strong_etag;
use crate::types::error::{classify_error, ObjectError, StorageErrorKind};
use crate::types::Object;

async fn run_filter<F>(ctx: StageContext, predicate: F)
where
    F: Fn(&Object) -> bool,
{
    loop {
        match next_event(&ctx).await {
            StageEvent::Object(object) => {
                if !predicate(&object) {
                    debug!(stage = ctx.name(), key = object.key, "object filtered.");
                    continue;
                }
                if !ctx.send(object).await {
                    return;
                }
            }
            StageEvent::Closed => {
                trace!(stage = ctx.name(), "filter has been completed.");
                return;
            }
            StageEvent::Cancelled => {
                trace!(stage = ctx.name(), "filter has been cancelled.");
                return;
            }
        }
    }
}

fn extension_matches(key: &str, extensions: &[String]) -> bool {
    let ext = Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("");

    extensions
        .iter()
        .any(|candidate| candidate.trim_start_matches('.') == ext)
}

fn content_type_matches(object: &Object, content_types: &[String]) -> bool {
    // an empty-string entry matches objects without a content type
    let content_type = object.content_type.as_deref().unwrap_or("");

    content_types.iter().any(|candidate| candidate == content_type)
}

/// Keep only objects whose key extension is in the configured list.
pub fn filter_by_ext(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let StageConfig::Extensions(extensions) = ctx.config().clone() else {
            ctx.send_config_error(None).await;
            return;
        };

        run_filter(ctx, move |object| extension_matches(&object.key, &extensions)).await
    })
}

/// Drop objects whose key extension is in the configured list.
pub fn filter_by_ext_not(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let StageConfig::Extensions(extensions) = ctx.config().clone() else {
            ctx.send_config_error(None).await;
            return;
        };

        run_filter(ctx, move |object| {
            !extension_matches(&object.key, &extensions)
        })
        .await
    })
}

/// Keep only objects whose content type is in the configured list. Objects
/// must already carry their metadata.
pub fn filter_by_content_type(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let StageConfig::ContentTypes(content_types) = ctx.config().clone() else {
            ctx.send_config_error(None).await;
            return;
        };

        run_filter(ctx, move |object| content_type_matches(object, &content_types)).await
    })
}

/// Drop objects whose content type is in the configured list.
pub fn filter_by_content_type_not(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let StageConfig::ContentTypes(content_types) = ctx.config().clone() else {
            ctx.send_config_error(None).await;
            return;
        };

        run_filter(ctx, move |object| {
            !content_type_matches(object, &content_types)
        })
        .await
    })
}

/// Keep objects modified at or after the configured unix timestamp.
pub fn filter_by_mtime_after(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let &StageConfig::Timestamp(threshold) = ctx.config() else {
            ctx.send_config_error(None).await;
            return;
        };

        run_filter(ctx, move |object| {
            object
                .mtime
                .map(|mtime| mtime.timestamp() >= threshold)
                .unwrap_or(false)
        })
        .await
    })
}

/// Keep objects modified strictly before the configured unix timestamp.
pub fn filter_by_mtime_before(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let &StageConfig::Timestamp(threshold) = ctx.config() else {
            ctx.send_config_error(None).await;
            return;
        };

        run_filter(ctx, move |object| {
            object
                .mtime
                .map(|mtime| mtime.timestamp() < threshold)
                .unwrap_or(false)
        })
        .await
    })
}

/// Keep only directory markers (keys ending with `/`).
pub fn filter_dirs(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move { run_filter(ctx, |object| object.key.ends_with('/')).await })
}

/// Drop directory markers.
pub fn filter_dirs_not(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move { run_filter(ctx, |object| !object.key.ends_with('/')).await })
}

/// Emit the object unless the target already holds the same key with an
/// identical strong ETag.
pub fn filter_modified(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        loop {
            match next_event(&ctx).await {
                StageEvent::Object(object) => {
                    let mut destination = Object::with_key(&object.key);
                    destination.version_id = object.version_id.clone();

                    let changed = match ctx.group.target.get_object_meta(&mut destination).await {
                        Ok(()) => match (&object.e_tag, &destination.e_tag) {
                            (Some(source), Some(target)) => {
                                strong_etag(source) != strong_etag(target)
                            }
                            // either side has no ETag to compare with
                            _ => true,
                        },
                        Err(e) => {
                            trace!(
                                stage = ctx.name(),
                                key = object.key,
                                error = %e,
                                "target meta unavailable. object treated as modified."
                            );
                            true
                        }
                    };

                    if !changed {
                        debug!(
                            stage = ctx.name(),
                            key = object.key,
                            "object unchanged on target. filtered."
                        );
                        continue;
                    }
                    if !ctx.send(object).await {
                        return;
                    }
                }
                StageEvent::Closed => {
                    trace!(stage = ctx.name(), "filter has been completed.");
                    return;
                }
                StageEvent::Cancelled => {
                    trace!(stage = ctx.name(), "filter has been cancelled.");
                    return;
                }
            }
        }
    })
}

async fn run_exist_filter(ctx: StageContext, emit_when_present: bool) {
    loop {
        match next_event(&ctx).await {
            StageEvent::Object(object) => {
                let mut probe = Object::with_key(&object.key);

                let present = match ctx.group.target.get_object_meta(&mut probe).await {
                    Ok(()) => true,
                    Err(e) if classify_error(&e) == StorageErrorKind::NotFound => false,
                    Err(e) => {
                        ctx.send_error(
                            ObjectError::new(&object.key, object.version_id.clone(), e).into(),
                        )
                        .await;
                        continue;
                    }
                };

                if present != emit_when_present {
                    debug!(stage = ctx.name(), key = object.key, "object filtered.");
                    continue;
                }
                if !ctx.send(object).await {
                    return;
                }
            }
            StageEvent::Closed => {
                trace!(stage = ctx.name(), "filter has been completed.");
                return;
            }
            StageEvent::Cancelled => {
                trace!(stage = ctx.name(), "filter has been cancelled.");
                return;
            }
        }
    }
}

/// Emit only objects whose key already exists on the target.
pub fn filter_exist(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move { run_exist_filter(ctx, true).await })
}

/// Emit only objects whose key does not exist on the target.
pub fn filter_exist_not(ctx: StageContext) -> BoxFuture<'static, ()> {
    Box::pin(async move { run_exist_filter(ctx, false).await })
}
