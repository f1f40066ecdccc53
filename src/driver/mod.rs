//! The driver: wires the backends, assembles the stage list from the
//! configuration record, runs the pipeline and turns its error stream into
//! a final status under the error-handling-mask policy.

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::pipeline::collection;
use crate::pipeline::stage::{Stage, StageConfig};
use crate::pipeline::{Group, RunningGroup};
use crate::storage::factory;
use crate::types::error::{
    classify_error, is_cancelled_error, ObjectError, StepConfigurationError,
};
use crate::types::token::PipelineCancellationToken;
use crate::types::{StoragePath, ACL_COPY_SENTINEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Ok,
    Failed,
    Aborted,
    ConfigurationError,
    Unknown,
}

impl SyncStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncStatus::Ok => 0,
            SyncStatus::Failed => 1,
            SyncStatus::Aborted => 2,
            SyncStatus::ConfigurationError => 3,
            SyncStatus::Unknown => 4,
        }
    }
}

pub struct SyncDriver {
    config: SyncConfig,
    cancellation_token: PipelineCancellationToken,
}

impl SyncDriver {
    pub fn new(config: SyncConfig, cancellation_token: PipelineCancellationToken) -> Self {
        Self {
            config,
            cancellation_token,
        }
    }

    pub async fn run(self) -> Result<SyncStatus> {
        let start = std::time::Instant::now();

        let pair =
            factory::create_storage_pair(&self.config, self.cancellation_token.clone()).await?;

        let mut group = Group::new(self.cancellation_token.clone());
        group.set_source(pair.source);
        group.set_target(pair.target);
        for stage in self.build_stages() {
            group.add_stage(stage);
        }

        info!("starting sync.");
        let running = group.run();

        let status = self.consume_errors(&running).await;

        let duration = start.elapsed().as_secs_f64();
        for stage_info in running.all_stage_info() {
            info!(
                index = stage_info.index,
                name = stage_info.name,
                input = stage_info.stats.input,
                output = stage_info.stats.output,
                errors = stage_info.stats.error,
                "stage finished."
            );
        }
        info!(duration = duration, status = ?status, "sync finished.");

        Ok(status)
    }

    /// The stage list, in the order the data flows: list, filters that work
    /// on bare keys, the metadata load when any later filter needs it,
    /// metadata filters, the ACL load for copy semantics, the data load,
    /// mutators, the upload and the tail stages.
    fn build_stages(&self) -> Vec<Stage> {
        let filters = &self.config.filters;
        let workers = self.config.worker_size;
        let mut stages = Vec::new();

        stages.push(
            Stage::new("ListSource", collection::list_source)
                .with_chan_size(self.config.list_buffer_size),
        );

        if !filters.include_exts.is_empty() {
            stages.push(
                Stage::new("FilterObjByExt", collection::filter_by_ext)
                    .with_config(StageConfig::Extensions(filters.include_exts.clone())),
            );
        }
        if !filters.exclude_exts.is_empty() {
            stages.push(
                Stage::new("FilterObjByExtNot", collection::filter_by_ext_not)
                    .with_config(StageConfig::Extensions(filters.exclude_exts.clone())),
            );
        }
        if filters.dirs_only {
            stages.push(Stage::new("FilterObjDirs", collection::filter_dirs));
        }
        if filters.skip_dirs {
            stages.push(Stage::new("FilterObjDirsNot", collection::filter_dirs_not));
        }

        let source_is_local = matches!(self.config.source, StoragePath::Local(_));
        if filters.needs_source_meta(source_is_local) {
            stages.push(
                Stage::new("LoadObjMeta", collection::load_object_meta).with_workers(workers),
            );
        }

        if let Some(timestamp) = filters.mtime_after {
            stages.push(
                Stage::new("FilterObjectsByMtimeAfter", collection::filter_by_mtime_after)
                    .with_config(StageConfig::Timestamp(timestamp)),
            );
        }
        if let Some(timestamp) = filters.mtime_before {
            stages.push(
                Stage::new(
                    "FilterObjectsByMtimeBefore",
                    collection::filter_by_mtime_before,
                )
                .with_config(StageConfig::Timestamp(timestamp)),
            );
        }
        if !filters.include_content_types.is_empty() {
            stages.push(
                Stage::new("FilterObjByCT", collection::filter_by_content_type).with_config(
                    StageConfig::ContentTypes(filters.include_content_types.clone()),
                ),
            );
        }
        if !filters.exclude_content_types.is_empty() {
            stages.push(
                Stage::new("FilterObjByCTNot", collection::filter_by_content_type_not)
                    .with_config(StageConfig::ContentTypes(
                        filters.exclude_content_types.clone(),
                    )),
            );
        }
        if filters.exist_only {
            stages.push(Stage::new("FilterObjectsExist", collection::filter_exist));
        }
        if filters.missing_only {
            stages.push(Stage::new(
                "FilterObjectsExistNot",
                collection::filter_exist_not,
            ));
        }
        if filters.modified_only {
            stages.push(Stage::new(
                "FilterObjectsModified",
                collection::filter_modified,
            ));
        }

        if self.config.acl.as_deref() == Some(ACL_COPY_SENTINEL) {
            stages.push(
                Stage::new("LoadObjACL", collection::load_object_acl).with_workers(workers),
            );
        }

        stages.push(Stage::new("LoadObjData", collection::load_object_data).with_workers(workers));

        if let Some(acl) = &self.config.acl {
            if !acl.is_empty() && acl != ACL_COPY_SENTINEL {
                stages.push(
                    Stage::new("ACLUpdater", collection::acl_updater)
                        .with_config(StageConfig::Acl(acl.clone())),
                );
            }
        }
        if let Some(storage_class) = &self.config.storage_class {
            stages.push(
                Stage::new("StorageClassUpdater", collection::storage_class_updater)
                    .with_config(StageConfig::StorageClass(storage_class.clone())),
            );
        }
        if let Some(cache_control) = &self.config.cache_control {
            stages.push(
                Stage::new("CacheControlUpdater", collection::cache_control_updater)
                    .with_config(StageConfig::CacheControl(cache_control.clone())),
            );
        }

        stages.push(
            Stage::new("UploadObj", collection::upload_object_data).with_workers(workers),
        );

        if self.config.sync_log {
            stages.push(Stage::new("Logger", collection::logger));
        }
        if let Some(rate) = self.config.rate_limit_objects {
            stages.push(
                Stage::new("RateLimit", collection::pipeline_rate_limit)
                    .with_config(StageConfig::ObjectsPerSec(rate)),
            );
        }

        stages.push(Stage::new("Terminator", collection::terminator));

        stages
    }

    /// Read the aggregate stream to the sentinel, even after cancelling, and
    /// fold the errors into a final status under the mask policy.
    async fn consume_errors(&self, running: &RunningGroup) -> SyncStatus {
        let errors = running.errors();
        let mut failure: Option<SyncStatus> = None;

        while let Ok(event) = errors.recv().await {
            let Some(pipeline_error) = event else {
                return match failure {
                    Some(status) => status,
                    None if self.cancellation_token.is_cancelled() => SyncStatus::Aborted,
                    None => SyncStatus::Ok,
                };
            };

            if pipeline_error
                .cause
                .downcast_ref::<StepConfigurationError>()
                .is_some()
            {
                error!(
                    stage = pipeline_error.stage_name,
                    error = %pipeline_error,
                    "pipeline configuration error. terminating."
                );
                failure = Some(SyncStatus::ConfigurationError);
                self.cancellation_token.cancel();
                continue;
            }

            if is_cancelled_error(&pipeline_error.cause) {
                continue;
            }

            let (key, kind) = match pipeline_error.cause.downcast_ref::<ObjectError>() {
                Some(object_error) => {
                    (object_error.key.clone(), classify_error(&object_error.cause))
                }
                None => (String::new(), classify_error(&pipeline_error.cause)),
            };

            if self.config.error_mask.tolerates(kind) {
                warn!(key = key, kind = %kind, error = %pipeline_error, "object skipped.");
                continue;
            }

            if failure.is_none() {
                error!(error = %pipeline_error, "sync error. terminating.");
                failure = Some(SyncStatus::Failed);
                self.cancellation_token.cancel();
            }
        }

        // the stream closed without a sentinel
        SyncStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_storage_url;

    fn driver_for(config: SyncConfig) -> SyncDriver {
        SyncDriver::new(
            config,
            crate::types::token::create_pipeline_cancellation_token(),
        )
    }

    fn base_config() -> SyncConfig {
        SyncConfig::new(
            parse_storage_url("/tmp/source").unwrap(),
            parse_storage_url("/tmp/target").unwrap(),
        )
    }

    fn stage_names(driver: &SyncDriver) -> Vec<String> {
        driver
            .build_stages()
            .iter()
            .map(|stage| stage.name.clone())
            .collect()
    }

    #[test]
    fn default_pipeline_shape() {
        let driver = driver_for(base_config());

        assert_eq!(
            stage_names(&driver),
            vec!["ListSource", "LoadObjData", "UploadObj", "Terminator"]
        );
    }

    #[test]
    fn local_mtime_filter_needs_meta_load() {
        let mut config = base_config();
        config.filters.mtime_after = Some(1674000000);

        let driver = driver_for(config);
        assert_eq!(
            stage_names(&driver),
            vec![
                "ListSource",
                "LoadObjMeta",
                "FilterObjectsByMtimeAfter",
                "LoadObjData",
                "UploadObj",
                "Terminator"
            ]
        );
    }

    #[test]
    fn acl_copy_adds_the_acl_load() {
        let mut config = base_config();
        config.acl = Some("copy".to_string());

        let driver = driver_for(config);
        let names = stage_names(&driver);
        assert!(names.contains(&"LoadObjACL".to_string()));
        assert!(!names.contains(&"ACLUpdater".to_string()));
    }

    #[test]
    fn canned_acl_adds_the_updater() {
        let mut config = base_config();
        config.acl = Some("public-read".to_string());

        let driver = driver_for(config);
        let names = stage_names(&driver);
        assert!(names.contains(&"ACLUpdater".to_string()));
        assert!(!names.contains(&"LoadObjACL".to_string()));
    }

    #[test]
    fn full_filter_chain_order() {
        let mut config = base_config();
        config.filters.include_exts = vec!["png".to_string()];
        config.filters.include_content_types = vec!["image/png".to_string()];
        config.filters.modified_only = true;
        config.sync_log = true;
        config.rate_limit_objects = Some(10);
        config.storage_class = Some("GLACIER".to_string());

        let driver = driver_for(config);
        assert_eq!(
            stage_names(&driver),
            vec![
                "ListSource",
                "FilterObjByExt",
                "LoadObjMeta",
                "FilterObjByCT",
                "FilterObjectsModified",
                "LoadObjData",
                "StorageClassUpdater",
                "UploadObj",
                "Logger",
                "RateLimit",
                "Terminator"
            ]
        );
    }
}
