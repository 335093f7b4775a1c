//! Auto Scaling group driver.
//!
//! One capability set over the managed group (describe, mutate the desired
//! count, read scaling history, run remote commands on members, request
//! member replacement) with a real AWS realization ([`AsgDriver`]) and a
//! dry-run realization ([`DryRunGroup`]) that reports an empty group and
//! logs every mutation it would have made.

mod driver;
mod remote;
mod reaper;

pub use driver::AsgDriver;
pub use remote::Platform;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("autoscaling API error: {0}")]
    Api(String),

    #[error("EC2 API error: {0}")]
    Ec2(String),

    #[error("remote command error: {0}")]
    Command(String),

    #[error("group {0} not found")]
    NotFound(String),

    #[error("page {page} exceeds allowed pages for DescribeScalingActivities, {max}")]
    PagingLimitExceeded { page: usize, max: usize },

    #[error("timed out waiting for the SSM agent to come online on {0}")]
    ReadinessTimeout(String),
}

/// Point-in-time view of the group, tick-scoped.
#[derive(Debug, Clone, Default)]
pub struct GroupSnapshot {
    /// Target currently set on the group.
    pub desired_count: i64,
    /// Members in the `InService` lifecycle state.
    pub actual_count: i64,
    /// Members in any `Pending*` lifecycle state.
    pub pending_count: i64,
    pub min_size: i64,
    pub max_size: i64,
    pub member_ids: Vec<String>,
}

/// Start times of the most recent user-driven capacity changes found in the
/// group's scaling-activity history.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalingActivityTimes {
    pub scale_out: Option<DateTime<Utc>>,
    pub scale_in: Option<DateTime<Utc>>,
}

/// Outcome of one dangling-instance sweep.
#[derive(Debug, Default)]
pub struct ReapReport {
    /// Running members old enough to be considered.
    pub candidates: usize,
    /// Members actually probed over SSM.
    pub checked: usize,
    /// Members handed to the group for replacement.
    pub marked: usize,
    /// First per-member failure; later ones are only logged.
    pub first_error: Option<String>,
}

#[async_trait]
pub trait GroupDriver: Send + Sync {
    async fn describe(&self) -> Result<GroupSnapshot, GroupError>;

    /// Idempotent; submitted without honoring the group's native cooldown.
    async fn set_desired_count(&self, count: i64) -> Result<(), GroupError>;

    /// Page through scaling history, newest first, until the requested
    /// kinds are found or pagination ends.
    async fn last_scaling_activities(
        &self,
        want_out: bool,
        want_in: bool,
    ) -> Result<ScalingActivityTimes, GroupError>;

    /// Sort members oldest-first by launch time and keep at most `limit`.
    async fn oldest_members(
        &self,
        ids: &[String],
        limit: usize,
    ) -> Result<Vec<String>, GroupError>;

    /// Write the termination marker on the member and stop its agent so it
    /// drains the current job and exits.
    async fn send_stop(&self, member_id: &str) -> Result<(), GroupError>;

    /// Ask the group to replace this member.
    async fn mark_unhealthy(&self, member_id: &str) -> Result<(), GroupError>;

    /// Find members whose agent died while the instance kept running, and
    /// mark them for replacement.
    async fn reap_dangling(
        &self,
        min_uptime: Duration,
        max_to_check: i64,
    ) -> Result<ReapReport, GroupError>;
}

/// Driver that reports an empty group and performs no mutations.
pub struct DryRunGroup;

#[async_trait]
impl GroupDriver for DryRunGroup {
    async fn describe(&self) -> Result<GroupSnapshot, GroupError> {
        Ok(GroupSnapshot::default())
    }

    async fn set_desired_count(&self, count: i64) -> Result<(), GroupError> {
        info!("[DryRun] Would set desired capacity to {count}");
        Ok(())
    }

    async fn last_scaling_activities(
        &self,
        _want_out: bool,
        _want_in: bool,
    ) -> Result<ScalingActivityTimes, GroupError> {
        Ok(ScalingActivityTimes::default())
    }

    async fn oldest_members(
        &self,
        ids: &[String],
        limit: usize,
    ) -> Result<Vec<String>, GroupError> {
        Ok(ids.iter().take(limit).cloned().collect())
    }

    async fn send_stop(&self, member_id: &str) -> Result<(), GroupError> {
        info!("[DryRun] Would send a graceful stop to instance {member_id}");
        Ok(())
    }

    async fn mark_unhealthy(&self, member_id: &str) -> Result<(), GroupError> {
        info!("[DryRun] Would mark instance {member_id} unhealthy");
        Ok(())
    }

    async fn reap_dangling(
        &self,
        min_uptime: Duration,
        max_to_check: i64,
    ) -> Result<ReapReport, GroupError> {
        info!("[DryRun] Would scan for dangling instances (min uptime: {min_uptime:?}, max check: {max_to_check})");
        Ok(ReapReport::default())
    }
}
