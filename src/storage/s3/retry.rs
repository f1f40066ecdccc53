use std::time::Duration;

use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_smithy_runtime_api::client::result::SdkError;

/// Fixed-delay retry policy applied inside the S3 backends. Retries stay
/// invisible to the pipeline; only errors that survive them escape.
#[derive(Debug, Clone)]
pub struct Retryer {
    retry_count: u32,
    delay: Duration,
}

impl Retryer {
    pub fn new(retry_count: u32, delay: Duration) -> Self {
        Self { retry_count, delay }
    }

    /// Whether a failed attempt should be retried. With a retry count of
    /// zero this is false immediately; a cancelled scope never retries.
    pub fn should_retry<E, R>(&self, e: &SdkError<E, R>, attempt: u32, cancelled: bool) -> bool
    where
        E: ProvideErrorMetadata,
    {
        if self.retry_count == 0 || attempt >= self.retry_count {
            return false;
        }
        if cancelled {
            return false;
        }

        is_transport_or_throttle_error(e)
    }

    pub async fn wait(&self) {
        tokio::time::sleep(self.delay).await;
    }
}

fn is_transport_or_throttle_error<E, R>(e: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    match e {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(_) => matches!(
            e.code(),
            Some(
                "SlowDown"
                    | "Throttling"
                    | "ThrottlingException"
                    | "RequestTimeout"
                    | "InternalError"
                    | "ServiceUnavailable"
            )
        ),
        _ => false,
    }
}
