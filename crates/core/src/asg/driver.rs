//! AWS realization of the group driver.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::remote::{self, Platform};
use super::{GroupDriver, GroupError, GroupSnapshot, ReapReport, ScalingActivityTimes};

const ACTIVITY_SUCCESSFUL_STATUS: &str = "Successful";
const USER_REQUEST_CAUSE: &str =
    "a user request explicitly set group desired capacity changing the desired capacity";
const SCALE_OUT_CAUSE: &str = "increasing the capacity";
const SCALE_IN_CAUSE: &str = "shrinking the capacity";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActivityKind {
    ScaleOut,
    ScaleIn,
}

/// A scaling activity qualifies only when it succeeded and was caused by an
/// explicit user-driven desired-count change.
pub(crate) fn classify_activity(status_code: &str, cause: &str) -> Option<ActivityKind> {
    if status_code != ACTIVITY_SUCCESSFUL_STATUS || !cause.contains(USER_REQUEST_CAUSE) {
        return None;
    }
    if cause.contains(SCALE_OUT_CAUSE) {
        return Some(ActivityKind::ScaleOut);
    }
    if cause.contains(SCALE_IN_CAUSE) {
        return Some(ActivityKind::ScaleIn);
    }
    None
}

pub struct AsgDriver {
    pub(crate) name: String,
    autoscaling: aws_sdk_autoscaling::Client,
    pub(crate) ec2: aws_sdk_ec2::Client,
    pub(crate) ssm: aws_sdk_ssm::Client,
    /// Page budget for DescribeScalingActivities; `None` is unlimited.
    max_activity_pages: Option<usize>,
    platform: OnceCell<Platform>,
}

impl AsgDriver {
    pub fn new(
        cfg: &aws_config::SdkConfig,
        name: impl Into<String>,
        max_activity_pages: Option<usize>,
    ) -> Self {
        Self {
            name: name.into(),
            autoscaling: aws_sdk_autoscaling::Client::new(cfg),
            ec2: aws_sdk_ec2::Client::new(cfg),
            ssm: aws_sdk_ssm::Client::new(cfg),
            max_activity_pages,
            platform: OnceCell::new(),
        }
    }

    /// Detect the member platform once; the group is assumed homogeneous.
    pub(crate) async fn member_platform(&self, member_id: &str) -> Platform {
        *self
            .platform
            .get_or_init(|| async {
                match self.detect_platform(member_id).await {
                    Ok(platform) => platform,
                    Err(err) => {
                        warn!("Could not detect platform for {member_id}, assuming Linux: {err}");
                        Platform::Linux
                    }
                }
            })
            .await
    }

    async fn detect_platform(&self, member_id: &str) -> Result<Platform, GroupError> {
        let output = self
            .ec2
            .describe_instances()
            .instance_ids(member_id)
            .send()
            .await
            .map_err(|e| GroupError::Ec2(e.to_string()))?;

        for reservation in output.reservations() {
            for instance in reservation.instances() {
                return Ok(platform_of(instance));
            }
        }
        Ok(Platform::Linux)
    }
}

/// EC2 leaves the platform attribute unset for Linux instances.
pub(crate) fn platform_of(instance: &aws_sdk_ec2::types::Instance) -> Platform {
    match instance.platform() {
        Some(platform) if platform.as_str().eq_ignore_ascii_case("windows") => Platform::Windows,
        _ => Platform::Linux,
    }
}

#[async_trait]
impl GroupDriver for AsgDriver {
    async fn describe(&self) -> Result<GroupSnapshot, GroupError> {
        info!("Collecting autoscaling details for group {:?}", self.name);
        let started = Instant::now();

        let output = self
            .autoscaling
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(&self.name)
            .send()
            .await
            .map_err(|e| GroupError::Api(e.to_string()))?;

        let group = output
            .auto_scaling_groups()
            .first()
            .ok_or_else(|| GroupError::NotFound(self.name.clone()))?;

        let mut pending = 0;
        let mut running = 0;
        let mut member_ids = Vec::new();
        for instance in group.instances() {
            if let Some(state) = instance.lifecycle_state() {
                if state.as_str().starts_with("Pending") {
                    pending += 1;
                }
                if state.as_str() == "InService" {
                    running += 1;
                }
            }
            if let Some(id) = instance.instance_id() {
                member_ids.push(id.to_string());
            }
        }

        let snapshot = GroupSnapshot {
            desired_count: i64::from(group.desired_capacity().unwrap_or(0)),
            actual_count: running,
            pending_count: pending,
            min_size: i64::from(group.min_size().unwrap_or(0)),
            max_size: i64::from(group.max_size().unwrap_or(0)),
            member_ids,
        };

        info!(
            "↳ Got pending={}, desired={}, actual={}, min={}, max={} (took {:?})",
            snapshot.pending_count,
            snapshot.desired_count,
            snapshot.actual_count,
            snapshot.min_size,
            snapshot.max_size,
            started.elapsed()
        );

        Ok(snapshot)
    }

    async fn set_desired_count(&self, count: i64) -> Result<(), GroupError> {
        self.autoscaling
            .set_desired_capacity()
            .auto_scaling_group_name(&self.name)
            .desired_capacity(count as i32)
            .honor_cooldown(false)
            .send()
            .await
            .map_err(|e| GroupError::Api(e.to_string()))?;
        Ok(())
    }

    async fn last_scaling_activities(
        &self,
        want_out: bool,
        want_in: bool,
    ) -> Result<ScalingActivityTimes, GroupError> {
        let mut times = ScalingActivityTimes::default();
        let mut next_token: Option<String> = None;
        let mut page = 0usize;

        loop {
            page += 1;
            if let Some(max) = self.max_activity_pages {
                if page > max {
                    return Err(GroupError::PagingLimitExceeded { page, max });
                }
            }

            let output = self
                .autoscaling
                .describe_scaling_activities()
                .auto_scaling_group_name(&self.name)
                .set_next_token(next_token.clone())
                .send()
                .await
                .map_err(|e| GroupError::Api(e.to_string()))?;

            for activity in output.activities() {
                let status = activity.status_code().map(|s| s.as_str()).unwrap_or_default();
                let cause = activity.cause().unwrap_or_default();
                match classify_activity(status, cause) {
                    Some(ActivityKind::ScaleOut) if times.scale_out.is_none() => {
                        times.scale_out = activity
                            .start_time()
                            .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0));
                    }
                    Some(ActivityKind::ScaleIn) if times.scale_in.is_none() => {
                        times.scale_in = activity
                            .start_time()
                            .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0));
                    }
                    _ => {}
                }
            }

            let found = (!want_out || times.scale_out.is_some())
                && (!want_in || times.scale_in.is_some());
            if found {
                break;
            }

            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        Ok(times)
    }

    async fn oldest_members(
        &self,
        ids: &[String],
        limit: usize,
    ) -> Result<Vec<String>, GroupError> {
        if ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let described = self
            .ec2
            .describe_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await;

        let output = match described {
            Ok(output) => output,
            Err(err) => {
                warn!("Could not get instance launch times, selecting unsorted: {err}");
                return Ok(ids.iter().take(limit).cloned().collect());
            }
        };

        let mut launched: Vec<(String, i64)> = Vec::new();
        for reservation in output.reservations() {
            for instance in reservation.instances() {
                if let (Some(id), Some(t)) = (instance.instance_id(), instance.launch_time()) {
                    launched.push((id.to_string(), t.secs()));
                }
            }
        }
        launched.sort_by_key(|(_, launch)| *launch);

        Ok(launched.into_iter().take(limit).map(|(id, _)| id).collect())
    }

    async fn send_stop(&self, member_id: &str) -> Result<(), GroupError> {
        let platform = self.member_platform(member_id).await;
        info!("Sending graceful stop to instance {member_id} via SSM Run Command");

        remote::wait_for_ssm_ready(&self.ssm, member_id, remote::STOP_READINESS_TIMEOUT).await?;
        remote::send_command(
            &self.ssm,
            member_id,
            platform,
            remote::stop_command(platform),
            "Gracefully stop the Buildkite agent",
        )
        .await?;

        Ok(())
    }

    async fn mark_unhealthy(&self, member_id: &str) -> Result<(), GroupError> {
        self.autoscaling
            .set_instance_health()
            .instance_id(member_id)
            .health_status("Unhealthy")
            .should_respect_grace_period(false)
            .send()
            .await
            .map_err(|e| GroupError::Api(e.to_string()))?;

        info!("Requested replacement of instance {member_id} (marked Unhealthy)");
        Ok(())
    }

    async fn reap_dangling(
        &self,
        min_uptime: Duration,
        max_to_check: i64,
    ) -> Result<ReapReport, GroupError> {
        self.reap(min_uptime, max_to_check).await
    }
}
