use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::Client;

use crate::config::{S3Config, S3Credentials};

/// Build the SDK client from our configuration. The SDK's own retry loop is
/// disabled; the backend retryer drives attempts with a fixed delay so they
/// stay observable.
pub async fn create_client(config: &S3Config) -> Client {
    let mut config_loader =
        aws_config::defaults(BehaviorVersion::latest()).retry_config(RetryConfig::disabled());

    if let Some(region) = &config.region {
        config_loader = config_loader.region(Region::new(region.clone()));
    }

    if let Some(endpoint_url) = &config.endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint_url);
    }

    if let S3Credentials::Static {
        access_key,
        secret_access_key,
        session_token,
    } = &config.credentials
    {
        let credentials = aws_sdk_s3::config::Credentials::new(
            access_key.clone(),
            secret_access_key.clone(),
            session_token.clone(),
            None,
            "blobsync",
        );
        config_loader = config_loader.credentials_provider(credentials);
    }

    let sdk_config = config_loader.load().await;

    Client::from_conf(
        Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build(),
    )
}
