//! SSM Run Command plumbing: readiness probing, command dispatch, result
//! fetch, and the platform-specific agent scripts.

use std::time::Duration;

use aws_sdk_ssm::types::{CommandInvocationStatus, InstanceInformationStringFilter, PingStatus};
use tokio::time::sleep;
use tracing::warn;

use super::GroupError;

pub(crate) const STOP_READINESS_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const REAP_READINESS_TIMEOUT: Duration = Duration::from_secs(120);

const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(5);
const INVOCATION_FETCH_ATTEMPTS: usize = 3;
const INVOCATION_FETCH_DELAY: Duration = Duration::from_secs(2);
const INVOCATION_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Groups are assumed homogeneous; the platform is detected once and reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
}

impl Platform {
    pub(crate) fn document_name(self) -> &'static str {
        match self {
            Platform::Linux => "AWS-RunShellScript",
            Platform::Windows => "AWS-RunPowerShellScript",
        }
    }
}

// Even after a graceful stop the service can stay "active" until the
// current job completes, so the termination marker is checked first.
const LINUX_CHECK_COMMAND: &str = r#"#!/bin/bash
if [ -f /tmp/buildkite-agent-termination-marker ]; then
  echo "MARKER_EXISTS: Instance is already marked for termination"
  cat /tmp/buildkite-agent-termination-marker
  exit 0
fi

ACTIVE_STATE=$(systemctl show buildkite-agent -p ActiveState | cut -d= -f2)
SUB_STATE=$(systemctl show buildkite-agent -p SubState | cut -d= -f2)

echo "Service status: ActiveState=$ACTIVE_STATE SubState=$SUB_STATE"

case "$ACTIVE_STATE" in
  "active")
    echo "RUNNING: Service is active ($SUB_STATE)"
    exit 0
    ;;
  "activating")
    echo "ACTIVATING: Service is starting"
    exit 0
    ;;
  *)
    systemctl status buildkite-agent --no-pager || true
    echo "NOT_RUNNING: Service is $ACTIVE_STATE/$SUB_STATE"
    exit 1
    ;;
esac
"#;

const WINDOWS_CHECK_COMMAND: &str = r#"$marker = "C:\buildkite-agent\termination-marker"
if (Test-Path $marker) {
  Write-Output "MARKER_EXISTS: Instance is already marked for termination"
  Get-Content $marker
  exit 0
}

$status = nssm status buildkite-agent
Write-Output "Service status: $status"

if ($status -match "SERVICE_RUNNING") {
  Write-Output "RUNNING: Service is running"
  exit 0
}

if ($status -match "SERVICE_START_PENDING") {
  Write-Output "ACTIVATING: Service is starting"
  exit 0
}

Write-Output "NOT_RUNNING: Service is $status"
exit 1
"#;

const LINUX_STOP_COMMAND: &str = r#"#!/bin/bash
if [ -f /tmp/buildkite-agent-termination-marker ]; then
  echo "MARKER_EXISTS: Instance is already marked for termination"
  exit 0
fi

date -u +%Y-%m-%dT%H:%M:%SZ > /tmp/buildkite-agent-termination-marker

sudo systemctl stop buildkite-agent.service || sudo /opt/buildkite-agent/bin/buildkite-agent stop --signal SIGTERM
"#;

const WINDOWS_STOP_COMMAND: &str = r#"$marker = "C:\buildkite-agent\termination-marker"
if (Test-Path $marker) {
  Write-Output "MARKER_EXISTS: Instance is already marked for termination"
  exit 0
}

Get-Date -Format o | Out-File -FilePath $marker

nssm stop buildkite-agent
"#;

/// Script that reports whether the agent is running on a member.
pub(crate) fn check_command(platform: Platform) -> &'static str {
    match platform {
        Platform::Linux => LINUX_CHECK_COMMAND,
        Platform::Windows => WINDOWS_CHECK_COMMAND,
    }
}

/// Script that marks a member for termination and stops its agent.
pub(crate) fn stop_command(platform: Platform) -> &'static str {
    match platform {
        Platform::Linux => LINUX_STOP_COMMAND,
        Platform::Windows => WINDOWS_STOP_COMMAND,
    }
}

/// Block until the SSM agent on `instance_id` reports `Online`, or the
/// timeout elapses.
pub(crate) async fn wait_for_ssm_ready(
    ssm: &aws_sdk_ssm::Client,
    instance_id: &str,
    timeout: Duration,
) -> Result<(), GroupError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let filter = InstanceInformationStringFilter::builder()
            .key("InstanceIds")
            .values(instance_id)
            .build()
            .expect("key and values are always set");

        match ssm
            .describe_instance_information()
            .filters(filter)
            .send()
            .await
        {
            Ok(output) => {
                let online = output
                    .instance_information_list()
                    .first()
                    .and_then(|info| info.ping_status())
                    .map(|status| matches!(status, PingStatus::Online))
                    .unwrap_or(false);
                if online {
                    return Ok(());
                }
            }
            Err(err) => {
                warn!("[SSM] DescribeInstanceInformation failed for {instance_id}: {err}");
            }
        }

        if tokio::time::Instant::now() + READINESS_POLL_INTERVAL > deadline {
            return Err(GroupError::ReadinessTimeout(instance_id.to_string()));
        }
        sleep(READINESS_POLL_INTERVAL).await;
    }
}

/// Dispatch a script to one member and return the command id.
pub(crate) async fn send_command(
    ssm: &aws_sdk_ssm::Client,
    instance_id: &str,
    platform: Platform,
    script: &str,
    comment: &str,
) -> Result<String, GroupError> {
    let output = ssm
        .send_command()
        .instance_ids(instance_id)
        .document_name(platform.document_name())
        .parameters("commands", vec![script.to_string()])
        .comment(comment)
        .send()
        .await
        .map_err(|e| GroupError::Command(e.to_string()))?;

    output
        .command()
        .and_then(|c| c.command_id())
        .map(str::to_string)
        .ok_or_else(|| {
            GroupError::Command(format!("SendCommand for {instance_id} returned no command id"))
        })
}

pub(crate) struct CommandResult {
    pub status: CommandInvocationStatus,
    pub output: String,
}

/// Fetch the invocation result, absorbing the eventual consistency between
/// "send" and "get result" with a small retry.
pub(crate) async fn fetch_invocation(
    ssm: &aws_sdk_ssm::Client,
    command_id: &str,
    instance_id: &str,
) -> Result<CommandResult, GroupError> {
    sleep(INVOCATION_SETTLE_DELAY).await;

    let mut last_err = None;
    for attempt in 1..=INVOCATION_FETCH_ATTEMPTS {
        match ssm
            .get_command_invocation()
            .command_id(command_id)
            .instance_id(instance_id)
            .send()
            .await
        {
            Ok(output) => match output.status() {
                Some(CommandInvocationStatus::Pending)
                | Some(CommandInvocationStatus::InProgress)
                | None => {}
                Some(status) => {
                    return Ok(CommandResult {
                        status: status.clone(),
                        output: output.standard_output_content().unwrap_or_default().to_string(),
                    });
                }
            },
            Err(err) => {
                warn!("Retrying GetCommandInvocation for {instance_id} (attempt {attempt}): {err}");
                last_err = Some(err.to_string());
            }
        }
        sleep(INVOCATION_FETCH_DELAY).await;
    }

    Err(GroupError::Command(last_err.unwrap_or_else(|| {
        format!("command {command_id} did not settle on {instance_id}")
    })))
}
