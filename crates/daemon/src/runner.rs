//! Fixed-interval tick driver.
//!
//! The loop is the retry mechanism: tick errors are logged and the next
//! tick runs on schedule. The server's poll hint only ever raises the
//! interval, and the raise sticks for the lifetime of the loop.

use std::time::Duration;

use bkscaler_core::Scaler;
use tokio::time::sleep;
use tracing::{info, warn};

/// Raise the interval when the server asks for a slower poll.
pub fn next_interval(current: Duration, poll_hint: Duration) -> Duration {
    if poll_hint > current {
        poll_hint
    } else {
        current
    }
}

/// Drive ticks until the deadline elapses or the process is interrupted.
pub async fn run_loop(scaler: &mut Scaler, initial_interval: Duration, deadline: Option<Duration>) {
    let mut interval = initial_interval;

    let deadline_sleep = async {
        match deadline {
            Some(deadline) => sleep(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline_sleep);

    loop {
        let (poll_hint, result) = scaler.run().await;
        if let Err(err) = result {
            warn!("Scaling error: {err}");
        }

        let raised = next_interval(interval, poll_hint);
        if raised > interval {
            interval = raised;
            info!("Increasing poll interval to {interval:?} based on rate limit");
        }

        info!("Waiting for {interval:?}");
        tokio::select! {
            _ = &mut deadline_sleep => {
                info!("Deadline reached, stopping");
                return;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                return;
            }
            _ = sleep(interval) => {}
        }
    }
}
