//! Desired-count computation.
//!
//! Pure arithmetic over one metrics sample and one group snapshot. Job
//! counts set the baseline; when agents fail to register on otherwise
//! healthy instances, the availability term adds a single instance per
//! tick once the group has converged. The result is unclamped; the scaler
//! applies the group's min/max bounds.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::asg::GroupSnapshot;
use crate::buildkite::QueueMetrics;

const MAX_REASONABLE_INSTANCES: i64 = 1000;
const STALE_METRICS_CUTOFF: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
struct MetricsCache {
    captured_at: Instant,
    total_agents: i64,
}

#[derive(Debug)]
pub struct ScalingCalculator {
    pub include_waiting: bool,
    pub agents_per_instance: i64,
    /// Fraction of expected agents below which the boost fires; 0 disables.
    pub availability_threshold: f64,
    pub elastic_ci_mode: bool,
    cache: Option<MetricsCache>,
}

impl ScalingCalculator {
    pub fn new(
        include_waiting: bool,
        agents_per_instance: i64,
        availability_threshold: f64,
        elastic_ci_mode: bool,
    ) -> Self {
        Self {
            include_waiting,
            agents_per_instance,
            availability_threshold,
            elastic_ci_mode,
            cache: None,
        }
    }

    fn per_instance(&self, count: i64) -> i64 {
        if self.agents_per_instance <= 0 {
            warn!(
                "⚠️  Invalid agents-per-instance value {}, defaulting to 1",
                self.agents_per_instance
            );
            return count;
        }

        let result = (count + self.agents_per_instance - 1) / self.agents_per_instance;

        if !(0..=MAX_REASONABLE_INSTANCES).contains(&result) {
            warn!("⚠️  Calculated unreasonable instance count {result}, capping at {MAX_REASONABLE_INSTANCES}");
            return MAX_REASONABLE_INSTANCES;
        }

        result
    }

    /// Compute the target instance count for one tick.
    pub fn desired_count(&mut self, metrics: &QueueMetrics, group: &GroupSnapshot) -> i64 {
        info!("Calculating desired instance count for Buildkite jobs");

        if self.elastic_ci_mode {
            if let Some(captured_at) = metrics.captured_at {
                let age = captured_at.elapsed();
                if age > STALE_METRICS_CUTOFF {
                    warn!(
                        "⚠️ [Elastic CI Mode] Metrics are {:.1}s old - too stale for scaling decisions",
                        age.as_secs_f64()
                    );
                    return group.desired_count;
                }
            }
        }

        // Prefer the cached agent count over a sample that is strictly
        // older than one we have already seen.
        let mut actual_agents = metrics.total_agents;
        match (metrics.captured_at, self.cache) {
            (Some(at), Some(cache)) if self.elastic_ci_mode && cache.captured_at > at => {
                warn!(
                    "⚠️ [Elastic CI Mode] Using cached agent count {} instead of stale count {}",
                    cache.total_agents, actual_agents
                );
                actual_agents = cache.total_agents;
            }
            (Some(at), _) => {
                self.cache = Some(MetricsCache {
                    captured_at: at,
                    total_agents: metrics.total_agents,
                });
            }
            (None, _) => {}
        }

        let instance_count = if group.actual_count > 0 {
            group.actual_count
        } else {
            group.desired_count
        };
        let expected_agents = self.agents_per_instance * instance_count;

        let mut availability = 1.0;
        if expected_agents > 0 {
            availability = actual_agents as f64 / expected_agents as f64;
            info!(
                "↳ 🧮 Agent availability: {:.2}% ({}/{})",
                availability * 100.0,
                actual_agents,
                expected_agents
            );
        }

        let mut agents_required = metrics.scheduled_jobs;

        // Waiting jobs can optionally pre-warm capacity so instances are
        // booted by the time the jobs get scheduled. A gamble: if the
        // instances scale down before the jobs arrive, it is a waste.
        if self.include_waiting && metrics.waiting_jobs > metrics.running_jobs {
            agents_required += metrics.waiting_jobs;
        } else {
            agents_required += metrics.running_jobs;
        }

        let mut desired = 0;
        if agents_required > 0 {
            desired = self.per_instance(agents_required);
        }

        let threshold = self.availability_threshold;
        if threshold > 0.0 && agents_required > 0 && availability < threshold {
            let missing_agents = expected_agents - actual_agents;
            warn!(
                "↳ 🚨 Availability below threshold ({:.2}% < {:.2}%), missing {} agents",
                availability * 100.0,
                threshold * 100.0,
                missing_agents
            );

            if group.actual_count == group.desired_count {
                let availability_target = (group.desired_count + 1).max(1);
                if availability_target > desired {
                    info!(
                        "↳ 📈 Boosting desired instances for low availability: {} -> {} ({} agents online vs {} expected)",
                        desired, availability_target, actual_agents, expected_agents
                    );
                    desired = availability_target;
                }
            } else {
                info!(
                    "↳ ⏳ Not boosting for low availability - group is still converging ({} actual vs {} desired)",
                    group.actual_count, group.desired_count
                );
            }
        }

        info!("↳ 🧮 Agents required {agents_required}, instances required {desired}");

        desired
    }
}
