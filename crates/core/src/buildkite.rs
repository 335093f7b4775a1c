//! Buildkite agent-metrics client.
//!
//! A single authenticated GET against the agent API's queue-metrics
//! endpoint. The server may ask for a slower poll via the
//! `Buildkite-Agent-Metrics-Poll-Duration` header; that hint is surfaced to
//! the caller as `poll_duration`.

use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Header carrying the server's minimum inter-poll interval, in seconds.
pub const POLL_DURATION_HEADER: &str = "Buildkite-Agent-Metrics-Poll-Duration";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics request failed: {0}")]
    Transport(String),

    #[error("agent token rejected (HTTP {status})")]
    Auth { status: u16 },

    #[error("metrics endpoint returned HTTP {status}")]
    Service { status: u16 },

    #[error("failed to decode metrics response: {0}")]
    Decode(String),
}

/// One sample of queue and agent counts, tick-scoped.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub org_slug: String,
    pub queue: String,
    pub scheduled_jobs: i64,
    pub running_jobs: i64,
    pub waiting_jobs: i64,
    pub idle_agents: i64,
    pub busy_agents: i64,
    pub total_agents: i64,
    /// Minimum interval the server asks us to honor before the next poll.
    /// Zero means no hint.
    pub poll_duration: Duration,
    /// Taken immediately before the request; `None` is the zero timestamp.
    pub captured_at: Option<Instant>,
}

#[derive(Debug, Default, Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    organization: Organization,
    #[serde(default)]
    agents: AgentCounts,
    #[serde(default)]
    jobs: JobCounts,
}

#[derive(Debug, Default, Deserialize)]
struct Organization {
    #[serde(default)]
    slug: String,
}

#[derive(Debug, Default, Deserialize)]
struct AgentCounts {
    #[serde(default)]
    idle: i64,
    #[serde(default)]
    busy: i64,
    #[serde(default)]
    total: i64,
}

#[derive(Debug, Default, Deserialize)]
struct JobCounts {
    #[serde(default)]
    scheduled: i64,
    #[serde(default)]
    running: i64,
    #[serde(default)]
    waiting: i64,
}

/// Client for the Buildkite agent API.
pub struct Client {
    endpoint: String,
    agent_token: String,
    user_agent: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(
        agent_token: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Result<Self, MetricsError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MetricsError::Transport(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.into(),
            agent_token: agent_token.into(),
            user_agent: format!("bkscaler/{}", env!("CARGO_PKG_VERSION")),
            http,
        })
    }

    /// Fetch current metrics for one queue.
    pub async fn get_agent_metrics(&self, queue: &str) -> Result<QueueMetrics, MetricsError> {
        info!("Collecting Buildkite metrics for queue {queue:?}");

        let captured_at = Instant::now();
        let url = format!("{}/metrics/queue", self.endpoint);

        let res = self
            .http
            .get(&url)
            .query(&[("name", queue)])
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Token {}", self.agent_token),
            )
            .send()
            .await
            .map_err(|e| MetricsError::Transport(e.to_string()))?;

        let status = res.status().as_u16();
        match status {
            200..=299 => {}
            401 | 403 => return Err(MetricsError::Auth { status }),
            _ => return Err(MetricsError::Service { status }),
        }

        let poll_duration = res
            .headers()
            .get(POLL_DURATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|raw| match raw.parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(err) => {
                    warn!("Failed to parse {POLL_DURATION_HEADER} header {raw:?}: {err}");
                    Duration::ZERO
                }
            })
            .unwrap_or(Duration::ZERO);

        let body: MetricsResponse = res
            .json()
            .await
            .map_err(|e| MetricsError::Decode(e.to_string()))?;

        let metrics = QueueMetrics {
            org_slug: body.organization.slug,
            queue: queue.to_string(),
            scheduled_jobs: body.jobs.scheduled,
            running_jobs: body.jobs.running,
            waiting_jobs: body.jobs.waiting,
            idle_agents: body.agents.idle,
            busy_agents: body.agents.busy,
            total_agents: body.agents.total,
            poll_duration,
            captured_at: Some(captured_at),
        };

        info!(
            "↳ Agents: idle={}, busy={}, total={}",
            metrics.idle_agents, metrics.busy_agents, metrics.total_agents
        );
        info!(
            "↳ Jobs: scheduled={}, running={}, waiting={} (took {:?})",
            metrics.scheduled_jobs,
            metrics.running_jobs,
            metrics.waiting_jobs,
            captured_at.elapsed()
        );

        Ok(metrics)
    }
}
