//! Environment-variable configuration.
//!
//! Everything the daemon needs is read from the environment at startup;
//! any missing required value or unparseable setting is fatal.

use std::env;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_AGENT_ENDPOINT: &str = "https://agent.buildkite.com/v3";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_AVAILABILITY_THRESHOLD: f64 = 0.5;
pub const DEFAULT_ASG_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MINIMUM_INSTANCE_UPTIME: Duration = Duration::from_secs(3600);
pub const DEFAULT_MAX_DANGLING_INSTANCES_TO_CHECK: i64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(String),

    #[error("{name} must be an integer: {message}")]
    InvalidInt { name: &'static str, message: String },

    #[error("{name} must be a number: {message}")]
    InvalidFloat { name: &'static str, message: String },

    #[error("{name} must be a boolean, got {value:?}")]
    InvalidBool { name: &'static str, value: String },

    #[error("{name} must be a duration: {message}")]
    InvalidDuration { name: &'static str, message: String },
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn require_string(name: &'static str) -> Result<String, ConfigError> {
    var(name).ok_or_else(|| ConfigError::Missing(name.to_string()))
}

fn require_i64(name: &'static str) -> Result<i64, ConfigError> {
    require_string(name)?
        .parse()
        .map_err(|e: std::num::ParseIntError| ConfigError::InvalidInt {
            name,
            message: e.to_string(),
        })
}

fn i64_or(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    match var(name) {
        Some(v) => v
            .parse()
            .map_err(|e: std::num::ParseIntError| ConfigError::InvalidInt {
                name,
                message: e.to_string(),
            }),
        None => Ok(default),
    }
}

fn f64_or(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    match var(name) {
        Some(v) => v
            .parse()
            .map_err(|e: std::num::ParseFloatError| ConfigError::InvalidFloat {
                name,
                message: e.to_string(),
            }),
        None => Ok(default),
    }
}

fn bool_flag(name: &'static str) -> Result<bool, ConfigError> {
    match var(name) {
        None => Ok(false),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            _ => Err(ConfigError::InvalidBool { name, value: v }),
        },
    }
}

fn duration_or(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match var(name) {
        Some(v) => humantime::parse_duration(&v).map_err(|e| ConfigError::InvalidDuration {
            name,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn opt_duration(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    match var(name) {
        Some(v) => humantime::parse_duration(&v)
            .map(Some)
            .map_err(|e| ConfigError::InvalidDuration {
                name,
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn opt_usize(name: &'static str) -> Result<Option<usize>, ConfigError> {
    match var(name) {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|e: std::num::ParseIntError| ConfigError::InvalidInt {
                name,
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub queue: String,
    pub asg_name: String,
    pub agents_per_instance: i64,
    pub agent_token: Option<String>,
    pub agent_token_ssm_key: Option<String>,
    pub agent_endpoint: String,
    pub interval: Duration,
    pub deadline: Option<Duration>,
    pub scale_in_cooldown: Duration,
    pub scale_out_cooldown: Duration,
    pub scale_in_factor: f64,
    pub scale_out_factor: f64,
    pub scale_only_after_all_event: bool,
    pub include_waiting: bool,
    pub instance_buffer: i64,
    pub disable_scale_in: bool,
    pub disable_scale_out: bool,
    pub cloudwatch_metrics: bool,
    pub elastic_ci_mode: bool,
    pub availability_threshold: f64,
    pub asg_activity_timeout: Duration,
    pub max_activity_pages: Option<usize>,
    pub minimum_instance_uptime: Duration,
    pub max_dangling_instances_to_check: i64,
    pub dry_run: bool,
    pub debug_one_shot: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let agent_token = var("BUILDKITE_AGENT_TOKEN");
        let agent_token_ssm_key = var("BUILDKITE_AGENT_TOKEN_SSM_KEY");
        if agent_token.is_none() && agent_token_ssm_key.is_none() {
            return Err(ConfigError::Missing(
                "BUILDKITE_AGENT_TOKEN or BUILDKITE_AGENT_TOKEN_SSM_KEY".to_string(),
            ));
        }

        Ok(Self {
            queue: require_string("BUILDKITE_QUEUE")?,
            asg_name: require_string("ASG_NAME")?,
            agents_per_instance: require_i64("AGENTS_PER_INSTANCE")?,
            agent_token,
            agent_token_ssm_key,
            agent_endpoint: var("BUILDKITE_AGENT_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_AGENT_ENDPOINT.to_string()),
            interval: duration_or("LAMBDA_INTERVAL", DEFAULT_INTERVAL)?,
            deadline: opt_duration("LAMBDA_TIMEOUT")?,
            scale_in_cooldown: duration_or("SCALE_IN_COOLDOWN_PERIOD", Duration::ZERO)?,
            scale_out_cooldown: duration_or("SCALE_OUT_COOLDOWN_PERIOD", Duration::ZERO)?,
            scale_in_factor: f64_or("SCALE_IN_FACTOR", 0.0)?.abs(),
            scale_out_factor: f64_or("SCALE_OUT_FACTOR", 0.0)?.abs(),
            scale_only_after_all_event: bool_flag("SCALE_ONLY_AFTER_ALL_EVENT")?,
            include_waiting: bool_flag("INCLUDE_WAITING")?,
            instance_buffer: i64_or("INSTANCE_BUFFER", 0)?,
            disable_scale_in: bool_flag("DISABLE_SCALE_IN")?,
            disable_scale_out: bool_flag("DISABLE_SCALE_OUT")?,
            cloudwatch_metrics: bool_flag("CLOUDWATCH_METRICS")?,
            elastic_ci_mode: bool_flag("ELASTIC_CI_MODE")?,
            availability_threshold: f64_or(
                "AVAILABILITY_THRESHOLD",
                DEFAULT_AVAILABILITY_THRESHOLD,
            )?,
            asg_activity_timeout: duration_or(
                "ASG_ACTIVITY_TIMEOUT",
                DEFAULT_ASG_ACTIVITY_TIMEOUT,
            )?,
            max_activity_pages: opt_usize("MAX_DESCRIBE_SCALING_ACTIVITIES_PAGES")?,
            minimum_instance_uptime: duration_or(
                "DANGLING_CHECK_MINIMUM_INSTANCE_UPTIME",
                DEFAULT_MINIMUM_INSTANCE_UPTIME,
            )?,
            max_dangling_instances_to_check: i64_or(
                "MAX_DANGLING_INSTANCES_TO_CHECK",
                DEFAULT_MAX_DANGLING_INSTANCES_TO_CHECK,
            )?,
            dry_run: bool_flag("DRY_RUN")?,
            debug_one_shot: var("DEBUG").is_some(),
        })
    }
}
