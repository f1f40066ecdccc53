//! Predefined stage functions that express the actual sync on top of the
//! engine: listing, filtering, loading, mutating and uploading objects.

pub use filter::{
    filter_by_content_type, filter_by_content_type_not, filter_by_ext, filter_by_ext_not,
    filter_by_mtime_after, filter_by_mtime_before, filter_dirs, filter_dirs_not, filter_exist,
    filter_exist_not, filter_modified,
};
pub use list::list_source;
pub use load::{load_object_acl, load_object_data, load_object_meta};
pub use misc::{logger, pipeline_rate_limit, terminator};
pub use transform::{acl_updater, cache_control_updater, storage_class_updater};
pub use upload::upload_object_data;

mod filter;
mod list;
mod load;
mod misc;
mod transform;
mod upload;

use crate::pipeline::stage::StageContext;
use crate::types::error::SyncError;
use crate::types::Object;

/// Receive loop shared by the consuming stages: yields objects until the
/// upstream closes, reports cancellation on the stage error channel and
/// stops promptly when the scope is cancelled.
pub(crate) enum StageEvent {
    Object(Object),
    Closed,
    Cancelled,
}

pub(crate) async fn next_event(ctx: &StageContext) -> StageEvent {
    let Some(input) = ctx.input.as_ref() else {
        return StageEvent::Closed;
    };

    tokio::select! {
        recv = input.recv() => match recv {
            Ok(object) => StageEvent::Object(object),
            Err(_) => StageEvent::Closed,
        },
        _ = ctx.group.cancellation_token.cancelled() => {
            ctx.send_error(SyncError::Cancelled.into()).await;
            StageEvent::Cancelled
        }
    }
}
