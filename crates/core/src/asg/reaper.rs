//! Dangling-instance reaper.
//!
//! A dangling instance is one whose agent process died while the instance
//! kept running. The "agent is dead" precondition implies no jobs are
//! running there, so handing the member to the group for replacement is
//! safe. Members whose agent is starting up, or that already carry the
//! termination marker, are left alone.

use std::time::Duration;

use aws_sdk_ssm::types::CommandInvocationStatus;
use chrono::Utc;
use tracing::{info, warn};

use super::driver::{platform_of, AsgDriver};
use super::remote::{self, Platform};
use super::{GroupDriver, GroupError, ReapReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AgentState {
    Running,
    /// Starting up or already marked for termination.
    Transitioning,
    NotRunning,
}

/// Classify the check script's verdict. A failed invocation counts as "not
/// running" unless the output shows the member is in a transient state.
pub(crate) fn classify_agent_check(invocation_failed: bool, output: &str) -> AgentState {
    if output.contains("MARKER_EXISTS") || output.contains("ACTIVATING") {
        return AgentState::Transitioning;
    }
    if invocation_failed || output.contains("NOT_RUNNING") {
        return AgentState::NotRunning;
    }
    AgentState::Running
}

impl AsgDriver {
    pub(crate) async fn reap(
        &self,
        min_uptime: Duration,
        max_to_check: i64,
    ) -> Result<ReapReport, GroupError> {
        info!(
            "[Elastic CI Mode] Starting dangling instance check for group {} (min uptime: {:?}, max check: {})",
            self.name, min_uptime, max_to_check
        );

        let snapshot = self.describe().await?;
        if snapshot.member_ids.is_empty() {
            info!("[Elastic CI Mode] No instances in group {} to check", self.name);
            return Ok(ReapReport::default());
        }

        let output = self
            .ec2
            .describe_instances()
            .set_instance_ids(Some(snapshot.member_ids.clone()))
            .send()
            .await
            .map_err(|e| GroupError::Ec2(e.to_string()))?;

        let now = Utc::now().timestamp();
        let min_uptime_secs = min_uptime.as_secs() as i64;

        let mut candidates: Vec<(String, i64, Platform)> = Vec::new();
        for reservation in output.reservations() {
            for instance in reservation.instances() {
                let Some(id) = instance.instance_id() else {
                    continue;
                };
                let Some(launch) = instance.launch_time() else {
                    continue;
                };
                let running = instance
                    .state()
                    .and_then(|s| s.name())
                    .map(|n| matches!(n, aws_sdk_ec2::types::InstanceStateName::Running))
                    .unwrap_or(false);
                if !running || now - launch.secs() < min_uptime_secs {
                    continue;
                }
                candidates.push((id.to_string(), launch.secs(), platform_of(instance)));
            }
        }

        if candidates.is_empty() {
            info!(
                "[Elastic CI Mode] No running instances older than {:?} in group {} to consider",
                min_uptime, self.name
            );
            return Ok(ReapReport::default());
        }

        // Oldest first, so long-lived zombies are cleared before fresh ones.
        candidates.sort_by_key(|(_, launch, _)| *launch);

        let limit = if max_to_check <= 0 {
            candidates.len()
        } else {
            candidates.len().min(max_to_check as usize)
        };

        // Homogeneous-group assumption: one platform for the whole batch.
        let platform = candidates[0].2;

        let mut report = ReapReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for (id, _, _) in candidates.into_iter().take(limit) {
            report.checked += 1;

            match self.check_agent(&id, platform).await {
                Ok(AgentState::Running) => {
                    info!("[Elastic CI Mode] Agent on instance {id} appears to be running normally");
                }
                Ok(AgentState::Transitioning) => {
                    info!("[Elastic CI Mode] Instance {id} has its agent in a transition state (marker exists or activating), not a dangling instance");
                }
                Ok(AgentState::NotRunning) => {
                    warn!("[Elastic CI Mode] 🧟 Found dangling instance {id} - the agent is not running");
                    match self.mark_unhealthy(&id).await {
                        Ok(()) => report.marked += 1,
                        Err(err) => {
                            warn!("[Elastic CI Mode] Failed to mark dangling instance {id} unhealthy: {err}");
                            if report.first_error.is_none() {
                                report.first_error = Some(err.to_string());
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!("[Elastic CI Mode] Could not check instance {id}, skipping: {err}");
                    if report.first_error.is_none() {
                        report.first_error = Some(err.to_string());
                    }
                }
            }
        }

        info!(
            "[Elastic CI Mode] Dangling instance check complete for group {}. Considered: {}, checked: {}, marked: {}",
            self.name, report.candidates, report.checked, report.marked
        );

        Ok(report)
    }

    async fn check_agent(&self, id: &str, platform: Platform) -> Result<AgentState, GroupError> {
        remote::wait_for_ssm_ready(&self.ssm, id, remote::REAP_READINESS_TIMEOUT).await?;

        let command_id = remote::send_command(
            &self.ssm,
            id,
            platform,
            remote::check_command(platform),
            "Check if the Buildkite agent is running",
        )
        .await?;

        let result = remote::fetch_invocation(&self.ssm, &command_id, id).await?;

        match result.status {
            CommandInvocationStatus::Success => Ok(classify_agent_check(false, &result.output)),
            CommandInvocationStatus::Failed => Ok(classify_agent_check(true, &result.output)),
            status => {
                warn!(
                    "[Elastic CI Mode] Agent status check for {id} did not succeed (status: {})",
                    status.as_str()
                );
                Ok(AgentState::Running)
            }
        }
    }
}
