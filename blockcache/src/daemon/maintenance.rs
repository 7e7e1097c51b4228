//! Periodic maintenance loop.
//!
//! Holds only a weak reference to its target so that dropping the engine is
//! enough to stop it.

use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[async_trait]
pub trait Maintenance: Send + Sync + 'static {
    /// One pass: reclaim idle buffers, schedule and poll write-back.
    async fn maintain(&self);
}

pub fn spawn<M: Maintenance>(
    target: Weak<M>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(target) = target.upgrade() else { break };
            target.maintain().await;
        }
        trace!("maintenance loop stopped");
    })
}
