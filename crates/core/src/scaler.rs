//! The per-tick scaling orchestrator.
//!
//! One `run()` drives a full tick: reap (Elastic CI mode), fetch metrics,
//! publish gauges, describe the group, compute the target, and scale in or
//! out through the cooldown and factor gates. Each tick is an independent
//! attempt; the loop around it is the retry mechanism.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::asg::{GroupDriver, GroupSnapshot};
use crate::buildkite::{Client, MetricsError, QueueMetrics};
use crate::calculator::ScalingCalculator;
use crate::cloudwatch::MetricsPublisher;
use crate::error::ScalerError;

const MAX_PROPORTIONAL_BUFFER: i64 = 1000;
const METRICS_AGE_WARNING: Duration = Duration::from_secs(60);
const ACTIVITY_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a tick's metrics come from.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn agent_metrics(&self) -> Result<QueueMetrics, MetricsError>;
}

/// The Buildkite client bound to one queue.
pub struct BuildkiteSource {
    pub client: Client,
    pub queue: String,
}

#[async_trait]
impl MetricsSource for BuildkiteSource {
    async fn agent_metrics(&self) -> Result<QueueMetrics, MetricsError> {
        self.client.get_agent_metrics(&self.queue).await
    }
}

/// Per-direction scaling policy. `last_event` persists across ticks within
/// one process lifetime and is reseeded from the group's scaling-activity
/// history after a cold start.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalePolicy {
    pub disable: bool,
    pub cooldown_period: Duration,
    /// Dampens (<1) or amplifies (>1) each adjustment; 0 means no factor.
    pub factor: f64,
    pub last_event: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct ScalerParams {
    pub agents_per_instance: i64,
    pub include_waiting: bool,
    pub instance_buffer: i64,
    pub scale_only_after_all_event: bool,
    pub availability_threshold: f64,
    pub elastic_ci_mode: bool,
    pub minimum_instance_uptime: Duration,
    pub max_dangling_instances_to_check: i64,
    pub scale_in: ScalePolicy,
    pub scale_out: ScalePolicy,
}

impl Default for ScalerParams {
    fn default() -> Self {
        Self {
            agents_per_instance: 1,
            include_waiting: false,
            instance_buffer: 0,
            scale_only_after_all_event: false,
            availability_threshold: 0.0,
            elastic_ci_mode: false,
            minimum_instance_uptime: Duration::from_secs(3600),
            max_dangling_instances_to_check: 5,
            scale_in: ScalePolicy::default(),
            scale_out: ScalePolicy::default(),
        }
    }
}

pub struct Scaler {
    group: Arc<dyn GroupDriver>,
    source: Arc<dyn MetricsSource>,
    publisher: Option<Arc<dyn MetricsPublisher>>,
    calculator: ScalingCalculator,
    scale_in: ScalePolicy,
    scale_out: ScalePolicy,
    instance_buffer: i64,
    scale_only_after_all_event: bool,
    elastic_ci_mode: bool,
    minimum_instance_uptime: Duration,
    max_dangling_instances_to_check: i64,
}

impl Scaler {
    pub fn new(
        group: Arc<dyn GroupDriver>,
        source: Arc<dyn MetricsSource>,
        publisher: Option<Arc<dyn MetricsPublisher>>,
        params: ScalerParams,
    ) -> Self {
        let calculator = ScalingCalculator::new(
            params.include_waiting,
            params.agents_per_instance,
            params.availability_threshold,
            params.elastic_ci_mode,
        );

        Self {
            group,
            source,
            publisher,
            calculator,
            scale_in: params.scale_in,
            scale_out: params.scale_out,
            instance_buffer: params.instance_buffer,
            scale_only_after_all_event: params.scale_only_after_all_event,
            elastic_ci_mode: params.elastic_ci_mode,
            minimum_instance_uptime: params.minimum_instance_uptime,
            max_dangling_instances_to_check: params.max_dangling_instances_to_check,
        }
    }

    /// Run one tick. The returned duration is the server's poll hint (zero
    /// when none was received), valid even when the tick errored.
    pub async fn run(&mut self) -> (Duration, Result<(), ScalerError>) {
        if self.elastic_ci_mode {
            info!("🛡️ [Elastic CI Mode] Running scaler with enhanced safety features (stale metrics detection, dangling instance protection)");
            if self.scale_in.disable {
                info!("ℹ️ [Elastic CI Mode] DISABLE_SCALE_IN=true is set but will be ignored in Elastic CI Mode to allow proper bidirectional scaling");
            }

            match self
                .group
                .reap_dangling(self.minimum_instance_uptime, self.max_dangling_instances_to_check)
                .await
            {
                Ok(report) => {
                    if let Some(err) = report.first_error {
                        warn!("[Elastic CI Mode] Warning: dangling instance check hit an error: {err}");
                    }
                }
                Err(err) => {
                    warn!("[Elastic CI Mode] Warning: Failed to cleanup dangling instances: {err}");
                }
            }
        }

        let metrics = match self.source.agent_metrics().await {
            Ok(metrics) => metrics,
            Err(err) => return (Duration::ZERO, Err(err.into())),
        };
        let poll_hint = metrics.poll_duration;

        if let Some(captured_at) = metrics.captured_at {
            let age = captured_at.elapsed();
            if age > METRICS_AGE_WARNING {
                warn!("⚠️ Using metrics that are {:.1} seconds old", age.as_secs_f64());
            }
        }

        if let Some(publisher) = &self.publisher {
            let gauges = [
                ("ScheduledJobsCount", metrics.scheduled_jobs),
                ("RunningJobsCount", metrics.running_jobs),
                ("WaitingJobsCount", metrics.waiting_jobs),
            ];
            if let Err(err) = publisher.publish(&metrics.org_slug, &metrics.queue, &gauges).await {
                return (poll_hint, Err(err.into()));
            }
        }

        let group = match self.group.describe().await {
            Ok(group) => group,
            Err(err) => return (poll_hint, Err(err.into())),
        };

        let mut desired = self.calculator.desired_count(&metrics, &group);

        // Extra headroom only while there is work, proportional to it, and
        // never more than the configured buffer.
        if metrics.scheduled_jobs > 0 || metrics.running_jobs > 0 || metrics.waiting_jobs > 0 {
            let mut total_jobs = metrics.scheduled_jobs + metrics.running_jobs;
            if self.calculator.include_waiting {
                total_jobs += metrics.waiting_jobs;
            }

            let agents_per_instance = self.calculator.agents_per_instance;
            let mut buffer = if agents_per_instance <= 0 {
                warn!("⚠️  Invalid agents-per-instance value {agents_per_instance}, defaulting to 1");
                total_jobs
            } else {
                (total_jobs + agents_per_instance - 1) / agents_per_instance
            };

            if !(0..=MAX_PROPORTIONAL_BUFFER).contains(&buffer) {
                warn!("⚠️  Calculated unreasonable proportional buffer {buffer}, capping at {MAX_PROPORTIONAL_BUFFER}");
                buffer = MAX_PROPORTIONAL_BUFFER;
            }
            buffer = buffer.min(self.instance_buffer);

            info!("↳ 🧮 Adding proportional instance buffer: {buffer} (based on {total_jobs} total jobs)");
            desired += buffer;
        }

        if desired > group.max_size {
            warn!("⚠️  Desired count exceeds MaxSize, capping at {}", group.max_size);
            desired = group.max_size;
        }
        if desired < group.min_size {
            warn!("⚠️  Desired count is less than MinSize, capping at {}", group.min_size);
            desired = group.min_size;
        }

        let instance_count = if group.actual_count > 0 {
            group.actual_count
        } else {
            group.desired_count
        };

        if desired > group.desired_count {
            info!(
                "Scaling decision: {} instances wanted, group desired {}, actual running {} (scheduled: {}, running: {}, waiting: {})",
                desired,
                group.desired_count,
                instance_count,
                metrics.scheduled_jobs,
                metrics.running_jobs,
                metrics.waiting_jobs
            );
            return (poll_hint, self.scale_out(desired, &group).await);
        }

        if desired < group.desired_count {
            if self.elastic_ci_mode && group.pending_count > 0 {
                info!(
                    "⏳ [Elastic CI Mode] Group has {} pending instances, waiting before scaling in",
                    group.pending_count
                );
                return (poll_hint, Ok(()));
            }
            info!(
                "Scaling decision: {} instances wanted, group desired {}, actual running {}",
                desired, group.desired_count, instance_count
            );
            return (poll_hint, self.scale_in(desired, &group).await);
        }

        if instance_count != desired {
            info!(
                "Instance count ({instance_count}) differs from wanted ({desired}) but the group target already matches; waiting for convergence"
            );
        } else {
            info!(
                "No scaling required, currently {} actual instances (desired set to {})",
                instance_count, group.desired_count
            );
        }

        (poll_hint, Ok(()))
    }

    async fn scale_out(
        &mut self,
        mut desired: i64,
        current: &GroupSnapshot,
    ) -> Result<(), ScalerError> {
        if self.scale_out.disable {
            return Ok(());
        }

        if let Some(last_out) = self.scale_out.last_event {
            let mut base = last_out;
            if self.scale_only_after_all_event {
                if let Some(last_in) = self.scale_in.last_event {
                    if last_in > base {
                        base = last_in;
                    }
                }
            }
            let elapsed = base.elapsed();
            if elapsed < self.scale_out.cooldown_period {
                let remaining = self.scale_out.cooldown_period - elapsed;
                info!("⏲ Want to scale OUT but in cooldown for {} seconds", remaining.as_secs());
                return Ok(());
            }
        }

        let change = desired - current.desired_count;

        if self.scale_out.factor != 0.0 {
            // Ceil so small positive deltas still reach the upper bound.
            let factored = (change as f64 * self.scale_out.factor).ceil() as i64;

            if factored > change {
                info!("👮 Increasing scale-out of {change} by factor of {:.2}", self.scale_out.factor);
            } else if factored < change {
                info!("👮 Decreasing scale-out of {change} by factor of {:.2}", self.scale_out.factor);
            } else {
                info!("👮 Scale-out factor of {:.2} was ignored", self.scale_out.factor);
            }

            desired = current.desired_count + factored;

            if desired > current.max_size {
                warn!("⚠️  Post scale-out-factor desired count exceeds MaxSize, capping at {}", current.max_size);
                desired = current.max_size;
            }
        }

        info!("Scaling OUT 📈 to {desired} instances (currently {})", current.desired_count);

        self.submit_desired_count(desired).await?;
        self.scale_out.last_event = Some(Instant::now());
        Ok(())
    }

    async fn scale_in(
        &mut self,
        mut desired: i64,
        current: &GroupSnapshot,
    ) -> Result<(), ScalerError> {
        if self.scale_in.disable && !self.elastic_ci_mode {
            return Ok(());
        }
        if self.scale_in.disable && self.elastic_ci_mode {
            info!("ℹ️ [Elastic CI Mode] Ignoring DISABLE_SCALE_IN=true since Elastic CI Mode has safer scaling mechanisms");
        }

        if let Some(last_in) = self.scale_in.last_event {
            let mut base = last_in;
            if self.scale_only_after_all_event {
                if let Some(last_out) = self.scale_out.last_event {
                    if last_out > base {
                        base = last_out;
                    }
                }
            }
            let elapsed = base.elapsed();
            if elapsed < self.scale_in.cooldown_period {
                let remaining = self.scale_in.cooldown_period - elapsed;
                info!("⏲ Want to scale IN but in cooldown for {} seconds", remaining.as_secs());
                return Ok(());
            }
        }

        // The in-process timestamp dies with the process; the group's real
        // activity history survives cold starts and is checked as well.
        if self.elastic_ci_mode && !self.scale_in.cooldown_period.is_zero() {
            match tokio::time::timeout(
                ACTIVITY_LOOKUP_TIMEOUT,
                self.group.last_scaling_activities(false, true),
            )
            .await
            {
                Ok(Ok(times)) => {
                    if let Some(last) = times.scale_in {
                        let since = Utc::now()
                            .signed_duration_since(last)
                            .to_std()
                            .unwrap_or_default();
                        if since < self.scale_in.cooldown_period {
                            info!(
                                "⏲ [Elastic CI Mode] Last group scale-in was {since:?} ago, in cooldown for {:?} more (cooldown: {:?})",
                                self.scale_in.cooldown_period - since,
                                self.scale_in.cooldown_period
                            );
                            return Ok(());
                        }
                        info!("[Elastic CI Mode] Last group scale-in was {since:?} ago");
                    }
                }
                Ok(Err(err)) => {
                    warn!("⚠️ [Elastic CI Mode] Could not check last group scale-in activity: {err}");
                }
                Err(_) => {
                    warn!("⚠️ [Elastic CI Mode] Timed out checking last group scale-in activity");
                }
            }
        }

        // Negative when shrinking.
        let change = desired - current.desired_count;

        if self.scale_in.factor != 0.0 {
            // Floor so small negative deltas still reach the lower bound.
            let factored = (change as f64 * self.scale_in.factor).floor() as i64;

            if factored < change {
                info!("👮 Increasing scale-in of {change} by factor of {:.2}", self.scale_in.factor);
            } else if factored > change {
                info!("👮 Decreasing scale-in of {change} by factor of {:.2}", self.scale_in.factor);
            } else {
                info!("👮 Scale-in factor of {:.2} was ignored", self.scale_in.factor);
            }

            desired = current.desired_count + factored;

            if desired < current.min_size {
                warn!("⚠️  Post scale-in-factor desired count lower than MinSize, capping at {}", current.min_size);
                desired = current.min_size;
            }
        }

        if desired < 0 {
            desired = 0;
        }

        info!("Scaling IN 📉 to {desired} instances (currently {})", current.desired_count);

        let to_stop = current.desired_count - desired;

        if self.elastic_ci_mode && !current.member_ids.is_empty() && to_stop > 0 {
            info!("[Elastic CI Mode] Using graceful termination for {to_stop} instances");

            let members = match self
                .group
                .oldest_members(&current.member_ids, to_stop as usize)
                .await
            {
                Ok(members) => members,
                Err(err) => {
                    warn!("[Elastic CI Mode] Warning: Could not order members by launch time: {err}");
                    current
                        .member_ids
                        .iter()
                        .take(to_stop as usize)
                        .cloned()
                        .collect()
                }
            };

            info!("Sending graceful stop to {} instances: {members:?}", members.len());

            let mut failures = 0;
            for member in &members {
                match self.group.send_stop(member).await {
                    Ok(()) => info!("✅ Successfully sent graceful stop to instance {member}"),
                    Err(err) => {
                        warn!("⚠️  Failed to send graceful stop to instance {member}: {err}");
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                warn!("⚠️  Failed to send graceful stop to {failures}/{} instances", members.len());
            }

            // The desired count must drop even when stops failed, so the
            // group does not relaunch what the agents are about to drain.
            info!("[Elastic CI Mode] Updating group desired capacity to {desired} after graceful stops");
            if let Err(err) = self.submit_desired_count(desired).await {
                error!(
                    "CRITICAL: [Elastic CI Mode] Failed to set desired capacity to {desired} after graceful stops: {err}. The group may replace stopped instances."
                );
            }

            self.scale_in.last_event = Some(Instant::now());
            return Ok(());
        }

        self.submit_desired_count(desired).await?;
        self.scale_in.last_event = Some(Instant::now());
        Ok(())
    }

    async fn submit_desired_count(&self, desired: i64) -> Result<(), ScalerError> {
        let started = Instant::now();
        self.group.set_desired_count(desired).await?;
        info!("↳ Setting desired to {desired} (took {:?})", started.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::{GroupError, ReapReport, ScalingActivityTimes};
    use crate::cloudwatch::PublishError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGroupState {
        desired: i64,
        /// Zero defaults to `desired` in `describe`, like a settled group.
        actual: i64,
        pending: i64,
        min_size: i64,
        max_size: i64,
        member_ids: Vec<String>,
        stops_sent: Vec<String>,
        set_calls: usize,
        reap_calls: usize,
        last_scale_in_activity: Option<chrono::DateTime<Utc>>,
    }

    struct FakeGroup {
        state: Mutex<FakeGroupState>,
    }

    impl FakeGroup {
        fn with_desired(desired: i64) -> Self {
            let member_ids = (0..desired).map(|i| format!("i-{i:012}")).collect();
            Self {
                state: Mutex::new(FakeGroupState {
                    desired,
                    max_size: 100,
                    member_ids,
                    ..Default::default()
                }),
            }
        }

        fn actual(self, actual: i64) -> Self {
            self.state.lock().unwrap().actual = actual;
            self
        }

        fn pending(self, pending: i64) -> Self {
            self.state.lock().unwrap().pending = pending;
            self
        }

        fn bounds(self, min_size: i64, max_size: i64) -> Self {
            {
                let mut state = self.state.lock().unwrap();
                state.min_size = min_size;
                state.max_size = max_size;
            }
            self
        }

        fn last_scale_in_activity(self, at: chrono::DateTime<Utc>) -> Self {
            self.state.lock().unwrap().last_scale_in_activity = Some(at);
            self
        }

        fn desired(&self) -> i64 {
            self.state.lock().unwrap().desired
        }

        fn set_calls(&self) -> usize {
            self.state.lock().unwrap().set_calls
        }

        fn reap_calls(&self) -> usize {
            self.state.lock().unwrap().reap_calls
        }

        fn stops_sent(&self) -> Vec<String> {
            self.state.lock().unwrap().stops_sent.clone()
        }
    }

    #[async_trait]
    impl GroupDriver for FakeGroup {
        async fn describe(&self) -> Result<GroupSnapshot, GroupError> {
            let state = self.state.lock().unwrap();
            let actual = if state.actual == 0 { state.desired } else { state.actual };
            Ok(GroupSnapshot {
                desired_count: state.desired,
                actual_count: actual,
                pending_count: state.pending,
                min_size: state.min_size,
                max_size: state.max_size,
                member_ids: state.member_ids.clone(),
            })
        }

        async fn set_desired_count(&self, count: i64) -> Result<(), GroupError> {
            let mut state = self.state.lock().unwrap();
            state.desired = count;
            state.set_calls += 1;
            Ok(())
        }

        async fn last_scaling_activities(
            &self,
            _want_out: bool,
            _want_in: bool,
        ) -> Result<ScalingActivityTimes, GroupError> {
            Ok(ScalingActivityTimes {
                scale_out: None,
                scale_in: self.state.lock().unwrap().last_scale_in_activity,
            })
        }

        async fn oldest_members(
            &self,
            ids: &[String],
            limit: usize,
        ) -> Result<Vec<String>, GroupError> {
            Ok(ids.iter().take(limit).cloned().collect())
        }

        async fn send_stop(&self, member_id: &str) -> Result<(), GroupError> {
            self.state.lock().unwrap().stops_sent.push(member_id.to_string());
            Ok(())
        }

        async fn mark_unhealthy(&self, _member_id: &str) -> Result<(), GroupError> {
            Ok(())
        }

        async fn reap_dangling(
            &self,
            _min_uptime: Duration,
            _max_to_check: i64,
        ) -> Result<ReapReport, GroupError> {
            self.state.lock().unwrap().reap_calls += 1;
            Ok(ReapReport::default())
        }
    }

    struct FakeSource {
        metrics: QueueMetrics,
    }

    #[async_trait]
    impl MetricsSource for FakeSource {
        async fn agent_metrics(&self) -> Result<QueueMetrics, MetricsError> {
            Ok(self.metrics.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl MetricsSource for FailingSource {
        async fn agent_metrics(&self) -> Result<QueueMetrics, MetricsError> {
            Err(MetricsError::Transport("connection refused".into()))
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl MetricsPublisher for FailingPublisher {
        async fn publish(
            &self,
            _org_slug: &str,
            _queue: &str,
            _gauges: &[(&str, i64)],
        ) -> Result<(), PublishError> {
            Err(PublishError::Api("throttled".into()))
        }
    }

    fn metrics(scheduled: i64, running: i64, waiting: i64, total_agents: i64) -> QueueMetrics {
        QueueMetrics {
            org_slug: "llamacorp".into(),
            queue: "default".into(),
            scheduled_jobs: scheduled,
            running_jobs: running,
            waiting_jobs: waiting,
            total_agents,
            captured_at: Some(Instant::now()),
            ..Default::default()
        }
    }

    fn scaler(group: &Arc<FakeGroup>, sample: QueueMetrics, params: ScalerParams) -> Scaler {
        let driver: Arc<dyn GroupDriver> = Arc::clone(group);
        Scaler::new(driver, Arc::new(FakeSource { metrics: sample }), None, params)
    }

    fn ago(duration: Duration) -> Option<Instant> {
        Instant::now().checked_sub(duration)
    }

    #[tokio::test]
    async fn scales_out_for_scheduled_and_running_jobs() {
        let group = Arc::new(FakeGroup::with_desired(2));
        let mut s = scaler(&group, metrics(10, 2, 2, 2), ScalerParams::default());

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 12);
    }

    #[tokio::test]
    async fn scales_out_with_waiting_jobs_when_enabled() {
        let group = Arc::new(FakeGroup::with_desired(2));
        let params = ScalerParams { include_waiting: true, ..Default::default() };
        let mut s = scaler(&group, metrics(8, 2, 20, 2), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 28);
    }

    #[tokio::test]
    async fn adds_the_instance_buffer_while_jobs_exist() {
        let group = Arc::new(FakeGroup::with_desired(12));
        let params = ScalerParams { instance_buffer: 10, ..Default::default() };
        let mut s = scaler(&group, metrics(10, 2, 2, 2), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 22);
    }

    #[tokio::test]
    async fn divides_jobs_across_agents_per_instance() {
        let group = Arc::new(FakeGroup::with_desired(1));
        let params = ScalerParams { agents_per_instance: 4, ..Default::default() };
        let mut s = scaler(&group, metrics(10, 2, 0, 4), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 3);
    }

    #[tokio::test]
    async fn rounds_instance_counts_up() {
        let group = Arc::new(FakeGroup::with_desired(1));
        let params = ScalerParams { agents_per_instance: 5, ..Default::default() };
        let mut s = scaler(&group, metrics(10, 2, 0, 5), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 3);
    }

    #[tokio::test]
    async fn enough_capacity_means_no_mutation() {
        let group = Arc::new(FakeGroup::with_desired(1));
        let params = ScalerParams { agents_per_instance: 20, ..Default::default() };
        let mut s = scaler(&group, metrics(10, 2, 0, 20), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 1);
        assert_eq!(group.set_calls(), 0);
    }

    #[tokio::test]
    async fn scale_out_factor_dampens_the_delta() {
        let group = Arc::new(FakeGroup::with_desired(2));
        let params = ScalerParams {
            scale_out: ScalePolicy { factor: 0.5, ..Default::default() },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(10, 2, 0, 2), params);

        let (_, result) = s.run().await;
        result.unwrap();
        // Delta 10 halves to 5 on top of the current 2.
        assert_eq!(group.desired(), 7);
    }

    #[tokio::test]
    async fn scale_out_factor_amplifies_within_max_size() {
        let group = Arc::new(FakeGroup::with_desired(0));
        let params = ScalerParams {
            scale_out: ScalePolicy { factor: 5.0, ..Default::default() },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(10, 0, 0, 0), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 50);
    }

    #[tokio::test]
    async fn scale_out_factor_rounds_up() {
        let group = Arc::new(FakeGroup::with_desired(11));
        let params = ScalerParams {
            scale_out: ScalePolicy { factor: 0.10, ..Default::default() },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(10, 2, 0, 11), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 12);
    }

    #[tokio::test]
    async fn cooldown_blocks_scale_out() {
        let group = Arc::new(FakeGroup::with_desired(4));
        let last_event = Some(Instant::now());
        let params = ScalerParams {
            scale_out: ScalePolicy {
                cooldown_period: Duration::from_secs(300),
                last_event,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(10, 2, 0, 4), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 4);
        assert_eq!(group.set_calls(), 0);
        // A blocked attempt must not advance the timestamp.
        assert_eq!(s.scale_out.last_event, last_event);
    }

    #[tokio::test]
    async fn elapsed_cooldown_allows_scale_out() {
        let group = Arc::new(FakeGroup::with_desired(4));
        let last_event = ago(Duration::from_secs(600));
        let params = ScalerParams {
            scale_out: ScalePolicy {
                cooldown_period: Duration::from_secs(300),
                last_event,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(10, 2, 0, 4), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 12);
        // A successful scale-out advances the timestamp.
        assert!(s.scale_out.last_event.unwrap() > last_event.unwrap());
    }

    #[tokio::test]
    async fn factor_applies_after_cooldown_expires() {
        let group = Arc::new(FakeGroup::with_desired(4));
        let params = ScalerParams {
            scale_out: ScalePolicy {
                cooldown_period: Duration::from_secs(300),
                last_event: ago(Duration::from_secs(600)),
                factor: 2.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(10, 2, 0, 4), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 20);
    }

    #[tokio::test]
    async fn disabled_scale_out_is_a_noop() {
        let group = Arc::new(FakeGroup::with_desired(1));
        let params = ScalerParams {
            scale_out: ScalePolicy { disable: true, ..Default::default() },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(10, 2, 0, 1), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 1);
        assert_eq!(group.set_calls(), 0);
        assert!(s.scale_out.last_event.is_none());
    }

    #[tokio::test]
    async fn all_event_cooldown_blocks_scale_out_after_recent_scale_in() {
        let group = Arc::new(FakeGroup::with_desired(1));
        let params = ScalerParams {
            scale_only_after_all_event: true,
            scale_in: ScalePolicy {
                cooldown_period: Duration::from_secs(300),
                last_event: ago(Duration::from_secs(60)),
                ..Default::default()
            },
            scale_out: ScalePolicy {
                cooldown_period: Duration::from_secs(120),
                last_event: ago(Duration::from_secs(600)),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(2, 0, 0, 1), params);

        let (_, result) = s.run().await;
        result.unwrap();
        // The scale-out cooldown itself has elapsed, but the more recent
        // scale-in restarts the clock when the all-event gate is on.
        assert_eq!(group.desired(), 1);
        assert_eq!(group.set_calls(), 0);
    }

    #[tokio::test]
    async fn target_is_clamped_to_max_size() {
        let group = Arc::new(FakeGroup::with_desired(2));
        let mut s = scaler(&group, metrics(500, 0, 0, 2), ScalerParams::default());

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 100);
    }

    #[tokio::test]
    async fn target_is_lifted_to_min_size() {
        let group = Arc::new(FakeGroup::with_desired(10).bounds(5, 100));
        let mut s = scaler(&group, metrics(0, 0, 0, 10), ScalerParams::default());

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 5);
    }

    #[tokio::test]
    async fn min_size_wins_when_bounds_are_inverted() {
        // The group API never validates min <= max; clamping to max and
        // then lifting to min degenerates to min.
        let group = Arc::new(FakeGroup::with_desired(4).bounds(5, 3));
        let mut s = scaler(&group, metrics(50, 0, 0, 4), ScalerParams::default());

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 5);
    }

    #[tokio::test]
    async fn cooldown_blocks_scale_in() {
        let group = Arc::new(FakeGroup::with_desired(10));
        let params = ScalerParams {
            scale_in: ScalePolicy {
                cooldown_period: Duration::from_secs(300),
                last_event: Some(Instant::now()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(0, 0, 0, 10), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 10);
        assert_eq!(group.set_calls(), 0);
    }

    #[tokio::test]
    async fn scale_in_factor_steps_down_slowly() {
        let group = Arc::new(FakeGroup::with_desired(10));
        let params = ScalerParams {
            scale_in: ScalePolicy {
                cooldown_period: Duration::from_secs(300),
                last_event: ago(Duration::from_secs(600)),
                factor: 0.10,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(0, 0, 0, 10), params);

        let (_, result) = s.run().await;
        result.unwrap();
        // Delta -10 at factor 0.10 floors to -1.
        assert_eq!(group.desired(), 9);
    }

    #[tokio::test]
    async fn scale_in_reclaims_buffer_surplus() {
        let group = Arc::new(FakeGroup::with_desired(30));
        let params = ScalerParams { instance_buffer: 10, ..Default::default() };
        let mut s = scaler(&group, metrics(10, 5, 0, 30), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 25);
    }

    #[tokio::test]
    async fn absurd_scale_in_factor_never_goes_below_zero() {
        let group = Arc::new(FakeGroup::with_desired(20));
        let params = ScalerParams {
            scale_in: ScalePolicy { factor: 5.0, ..Default::default() },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(10, 0, 0, 20), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 0);
    }

    #[tokio::test]
    async fn scale_in_factor_rounds_down_to_reach_zero() {
        let group = Arc::new(FakeGroup::with_desired(1));
        let params = ScalerParams {
            scale_in: ScalePolicy { factor: 0.10, ..Default::default() },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(0, 0, 0, 1), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 0);
    }

    #[tokio::test]
    async fn disabled_scale_in_is_a_noop() {
        let group = Arc::new(FakeGroup::with_desired(1));
        let params = ScalerParams {
            scale_in: ScalePolicy { disable: true, ..Default::default() },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(0, 0, 0, 1), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 1);
        assert_eq!(group.set_calls(), 0);
    }

    #[tokio::test]
    async fn all_event_cooldown_blocks_scale_in_after_recent_scale_out() {
        let group = Arc::new(FakeGroup::with_desired(3));
        let params = ScalerParams {
            scale_only_after_all_event: true,
            scale_out: ScalePolicy {
                cooldown_period: Duration::from_secs(300),
                last_event: ago(Duration::from_secs(60)),
                ..Default::default()
            },
            scale_in: ScalePolicy {
                cooldown_period: Duration::from_secs(120),
                last_event: ago(Duration::from_secs(600)),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(0, 0, 0, 3), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 3);
        assert_eq!(group.set_calls(), 0);
    }

    #[tokio::test]
    async fn low_availability_boosts_converged_group() {
        let group = Arc::new(FakeGroup::with_desired(2));
        let params = ScalerParams {
            agents_per_instance: 4,
            availability_threshold: 0.5,
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(5, 2, 0, 3), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 3);
    }

    #[tokio::test]
    async fn low_availability_waits_for_convergence() {
        let group = Arc::new(FakeGroup::with_desired(2).actual(1));
        let params = ScalerParams {
            agents_per_instance: 4,
            availability_threshold: 0.5,
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(5, 2, 0, 3), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 2);
    }

    #[tokio::test]
    async fn good_availability_does_not_boost() {
        let group = Arc::new(FakeGroup::with_desired(2));
        let params = ScalerParams {
            agents_per_instance: 4,
            availability_threshold: 0.5,
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(5, 2, 0, 7), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 2);
    }

    #[tokio::test]
    async fn availability_boost_overrides_lower_job_based_need() {
        let group = Arc::new(FakeGroup::with_desired(3));
        let params = ScalerParams {
            agents_per_instance: 4,
            availability_threshold: 0.5,
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(2, 0, 0, 2), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 4);
    }

    #[tokio::test]
    async fn job_based_need_wins_over_availability_boost() {
        let group = Arc::new(FakeGroup::with_desired(2));
        let params = ScalerParams {
            agents_per_instance: 4,
            availability_threshold: 0.5,
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(20, 0, 0, 2), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 5);
    }

    #[tokio::test]
    async fn empty_group_scales_from_jobs_alone() {
        let group = Arc::new(FakeGroup::with_desired(0));
        let params = ScalerParams {
            agents_per_instance: 4,
            availability_threshold: 0.5,
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(5, 0, 0, 0), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 2);
    }

    #[tokio::test]
    async fn elastic_mode_runs_the_reaper_first() {
        let group = Arc::new(FakeGroup::with_desired(2));
        let params = ScalerParams { elastic_ci_mode: true, ..Default::default() };
        let mut s = scaler(&group, metrics(0, 2, 0, 2), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.reap_calls(), 1);
    }

    #[tokio::test]
    async fn standard_mode_never_reaps() {
        let group = Arc::new(FakeGroup::with_desired(2));
        let mut s = scaler(&group, metrics(0, 2, 0, 2), ScalerParams::default());

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.reap_calls(), 0);
    }

    #[tokio::test]
    async fn elastic_mode_ignores_disable_scale_in() {
        let group = Arc::new(FakeGroup::with_desired(4));
        let params = ScalerParams {
            elastic_ci_mode: true,
            scale_in: ScalePolicy { disable: true, ..Default::default() },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(0, 0, 0, 4), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 0);
    }

    #[tokio::test]
    async fn elastic_mode_stops_the_oldest_members_before_shrinking() {
        let group = Arc::new(FakeGroup::with_desired(4));
        let params = ScalerParams { elastic_ci_mode: true, ..Default::default() };
        let mut s = scaler(&group, metrics(1, 0, 0, 4), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 1);
        // 4 -> 1 drains the three oldest members.
        assert_eq!(
            group.stops_sent(),
            vec!["i-000000000000", "i-000000000001", "i-000000000002"]
        );
    }

    #[tokio::test]
    async fn elastic_mode_waits_for_pending_instances_before_scaling_in() {
        let group = Arc::new(FakeGroup::with_desired(4).pending(1));
        let params = ScalerParams { elastic_ci_mode: true, ..Default::default() };
        let mut s = scaler(&group, metrics(0, 0, 0, 4), params);

        let (_, result) = s.run().await;
        result.unwrap();
        assert_eq!(group.desired(), 4);
        assert_eq!(group.set_calls(), 0);
        assert!(group.stops_sent().is_empty());
    }

    #[tokio::test]
    async fn elastic_mode_honors_the_groups_own_scale_in_history() {
        let group = Arc::new(
            FakeGroup::with_desired(4)
                .last_scale_in_activity(Utc::now() - chrono::Duration::seconds(60)),
        );
        let params = ScalerParams {
            elastic_ci_mode: true,
            scale_in: ScalePolicy {
                cooldown_period: Duration::from_secs(300),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut s = scaler(&group, metrics(0, 0, 0, 4), params);

        let (_, result) = s.run().await;
        result.unwrap();
        // The in-process timestamp is unset, but the group's history says a
        // scale-in happened a minute ago.
        assert_eq!(group.desired(), 4);
        assert_eq!(group.set_calls(), 0);
    }

    #[tokio::test]
    async fn converged_idle_group_stays_put_across_ticks() {
        let group = Arc::new(FakeGroup::with_desired(0));
        let mut s = scaler(&group, metrics(0, 0, 0, 0), ScalerParams::default());

        for _ in 0..2 {
            let (_, result) = s.run().await;
            result.unwrap();
        }
        assert_eq!(group.set_calls(), 0);
    }

    #[tokio::test]
    async fn poll_hint_is_surfaced_to_the_caller() {
        let group = Arc::new(FakeGroup::with_desired(0));
        let mut sample = metrics(0, 0, 0, 0);
        sample.poll_duration = Duration::from_secs(17);
        let mut s = scaler(&group, sample, ScalerParams::default());

        let (hint, result) = s.run().await;
        result.unwrap();
        assert_eq!(hint, Duration::from_secs(17));
    }

    #[tokio::test]
    async fn metrics_failure_aborts_the_tick() {
        let group = Arc::new(FakeGroup::with_desired(3));
        let driver: Arc<dyn GroupDriver> = Arc::clone(&group);
        let mut s = Scaler::new(driver, Arc::new(FailingSource), None, ScalerParams::default());

        let (hint, result) = s.run().await;
        assert_eq!(hint, Duration::ZERO);
        assert!(matches!(result, Err(ScalerError::Metrics(_))));
        assert_eq!(group.set_calls(), 0);
    }

    #[tokio::test]
    async fn publish_failure_surfaces_but_keeps_the_poll_hint() {
        let group = Arc::new(FakeGroup::with_desired(3));
        let mut sample = metrics(10, 0, 0, 3);
        sample.poll_duration = Duration::from_secs(20);
        let driver: Arc<dyn GroupDriver> = Arc::clone(&group);
        let mut s = Scaler::new(
            driver,
            Arc::new(FakeSource { metrics: sample }),
            Some(Arc::new(FailingPublisher)),
            ScalerParams::default(),
        );

        let (hint, result) = s.run().await;
        assert_eq!(hint, Duration::from_secs(20));
        assert!(matches!(result, Err(ScalerError::Publish(_))));
        assert_eq!(group.set_calls(), 0);
    }

    #[tokio::test]
    async fn dry_run_tick_never_mutates() {
        use crate::asg::DryRunGroup;
        use crate::cloudwatch::DryRunPublisher;

        let mut s = Scaler::new(
            Arc::new(DryRunGroup),
            Arc::new(FakeSource { metrics: metrics(25, 3, 1, 0) }),
            Some(Arc::new(DryRunPublisher)),
            ScalerParams::default(),
        );

        let (_, result) = s.run().await;
        result.unwrap();
    }
}
