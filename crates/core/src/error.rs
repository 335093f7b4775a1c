//! Error surface for a scaling tick.

use thiserror::Error;

use crate::asg::GroupError;
use crate::buildkite::MetricsError;
use crate::cloudwatch::PublishError;

/// Any failure a single tick can surface to the loop.
#[derive(Debug, Error)]
pub enum ScalerError {
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}
