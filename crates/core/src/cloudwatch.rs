//! Per-tick gauge publication.

use async_trait::async_trait;
use aws_sdk_cloudwatch::types::{Dimension, MetricDatum, StandardUnit};
use thiserror::Error;
use tracing::info;

const METRICS_NAMESPACE: &str = "Buildkite";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("CloudWatch publish failed: {0}")]
    Api(String),
}

#[async_trait]
pub trait MetricsPublisher: Send + Sync {
    async fn publish(
        &self,
        org_slug: &str,
        queue: &str,
        gauges: &[(&str, i64)],
    ) -> Result<(), PublishError>;
}

/// Publishes gauges to CloudWatch under the `Buildkite` namespace with
/// `{Org, Queue}` dimensions.
pub struct CloudWatchPublisher {
    client: aws_sdk_cloudwatch::Client,
}

impl CloudWatchPublisher {
    pub fn new(cfg: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_cloudwatch::Client::new(cfg),
        }
    }
}

#[async_trait]
impl MetricsPublisher for CloudWatchPublisher {
    async fn publish(
        &self,
        org_slug: &str,
        queue: &str,
        gauges: &[(&str, i64)],
    ) -> Result<(), PublishError> {
        let mut data = Vec::with_capacity(gauges.len());

        for (name, value) in gauges {
            info!("Publishing metric {name}={value} [org={org_slug},queue={queue}]");

            let org = Dimension::builder().name("Org").value(org_slug).build();
            let queue_dim = Dimension::builder().name("Queue").value(queue).build();

            data.push(
                MetricDatum::builder()
                    .metric_name(*name)
                    .unit(StandardUnit::Count)
                    .value(*value as f64)
                    .dimensions(org)
                    .dimensions(queue_dim)
                    .build(),
            );
        }

        self.client
            .put_metric_data()
            .namespace(METRICS_NAMESPACE)
            .set_metric_data(Some(data))
            .send()
            .await
            .map_err(|e| PublishError::Api(e.to_string()))?;

        Ok(())
    }
}

/// Logs what it would publish and publishes nothing.
pub struct DryRunPublisher;

#[async_trait]
impl MetricsPublisher for DryRunPublisher {
    async fn publish(
        &self,
        org_slug: &str,
        queue: &str,
        gauges: &[(&str, i64)],
    ) -> Result<(), PublishError> {
        for (name, value) in gauges {
            info!("[DryRun] Would publish metric {name}={value} [org={org_slug},queue={queue}]");
        }
        Ok(())
    }
}
