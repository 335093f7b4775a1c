//! bkscaler: autoscaler daemon for Buildkite agent Auto Scaling groups.

mod config;
mod runner;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bkscaler_core::asg::{AsgDriver, DryRunGroup, GroupDriver};
use bkscaler_core::buildkite::Client;
use bkscaler_core::cloudwatch::{CloudWatchPublisher, DryRunPublisher, MetricsPublisher};
use bkscaler_core::scaler::{BuildkiteSource, ScalePolicy, Scaler, ScalerParams};
use bkscaler_core::secrets::SecretResolver;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

/// Seeded scale timestamps survive warm reuse of the process image; the
/// mutex keeps concurrent invocations from both issuing history queries.
static SEEDED_EVENTS: Mutex<Option<(Option<Instant>, Option<Instant>)>> = Mutex::const_new(None);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("bkscaler version {}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::from_env()?;
    let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let token = match &settings.agent_token_ssm_key {
        Some(key) => SecretResolver::new(&cfg).fetch_token(key).await?,
        None => settings
            .agent_token
            .clone()
            .unwrap_or_default(),
    };

    let client = Client::new(token, settings.agent_endpoint.clone())?;
    let source = Arc::new(BuildkiteSource {
        client,
        queue: settings.queue.clone(),
    });

    let max_activity_pages = match (settings.elastic_ci_mode, settings.max_activity_pages) {
        (true, Some(pages)) => {
            info!(
                "ℹ️ [Elastic CI Mode] Ignoring MAX_DESCRIBE_SCALING_ACTIVITIES_PAGES={pages} to allow full activity history"
            );
            None
        }
        (_, pages) => pages,
    };

    let group: Arc<dyn GroupDriver> = if settings.dry_run {
        info!("Running as a dry-run, no changes will be made");
        Arc::new(DryRunGroup)
    } else {
        Arc::new(AsgDriver::new(
            &cfg,
            settings.asg_name.clone(),
            max_activity_pages,
        ))
    };

    let publisher: Option<Arc<dyn MetricsPublisher>> = if settings.cloudwatch_metrics {
        info!("Publishing CloudWatch metrics");
        if settings.dry_run {
            Some(Arc::new(DryRunPublisher))
        } else {
            Some(Arc::new(CloudWatchPublisher::new(&cfg)))
        }
    } else {
        None
    };

    let (last_scale_in, last_scale_out) =
        seeded_scale_events(group.as_ref(), settings.asg_activity_timeout).await;

    if settings.disable_scale_in {
        info!("Disabling scale-in 🙅🏼");
    }
    if settings.disable_scale_out {
        info!("Disabling scale-out 🙅🏼‍♂️");
    }

    let params = ScalerParams {
        agents_per_instance: settings.agents_per_instance,
        include_waiting: settings.include_waiting,
        instance_buffer: settings.instance_buffer,
        scale_only_after_all_event: settings.scale_only_after_all_event,
        availability_threshold: settings.availability_threshold,
        elastic_ci_mode: settings.elastic_ci_mode,
        minimum_instance_uptime: settings.minimum_instance_uptime,
        max_dangling_instances_to_check: settings.max_dangling_instances_to_check,
        scale_in: ScalePolicy {
            disable: settings.disable_scale_in,
            cooldown_period: settings.scale_in_cooldown,
            factor: settings.scale_in_factor,
            last_event: last_scale_in,
        },
        scale_out: ScalePolicy {
            disable: settings.disable_scale_out,
            cooldown_period: settings.scale_out_cooldown,
            factor: settings.scale_out_factor,
            last_event: last_scale_out,
        },
    };

    let mut scaler = Scaler::new(group, source, publisher, params);

    if settings.debug_one_shot {
        let (_, result) = scaler.run().await;
        result?;
        return Ok(());
    }

    runner::run_loop(&mut scaler, settings.interval, settings.deadline).await;
    Ok(())
}

/// Reseed the last scale-in/scale-out timestamps from the group's real
/// scaling-activity history. Timing out or failing just means "no prior
/// event known".
async fn seeded_scale_events(
    group: &dyn GroupDriver,
    timeout: Duration,
) -> (Option<Instant>, Option<Instant>) {
    let mut seeded = SEEDED_EVENTS.lock().await;
    if let Some(events) = *seeded {
        return events;
    }

    let events = match tokio::time::timeout(timeout, group.last_scaling_activities(true, true))
        .await
    {
        Ok(Ok(times)) => {
            let now = chrono::Utc::now();
            let to_instant = |t: chrono::DateTime<chrono::Utc>| {
                now.signed_duration_since(t)
                    .to_std()
                    .ok()
                    .and_then(|age| Instant::now().checked_sub(age))
            };
            let scale_in = times.scale_in.and_then(to_instant);
            let scale_out = times.scale_out.and_then(to_instant);
            if scale_in.is_some() || scale_out.is_some() {
                info!("Seeded scale timestamps from the group's scaling history");
            }
            (scale_in, scale_out)
        }
        Ok(Err(err)) => {
            warn!("Could not fetch scaling history, assuming no prior scale events: {err}");
            (None, None)
        }
        Err(_) => {
            warn!("Timed out fetching scaling history after {timeout:?}, assuming no prior scale events");
            (None, None)
        }
    };

    *seeded = Some(events);
    events
}
