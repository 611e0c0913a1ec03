use anyhow::Context;
use reqcount_core::{RequestCounter, TICK};
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Closes one bucket per tick and persists the result. Only returns when a
/// flush fails, which the caller treats as fatal.
pub async fn run(counter: Arc<RequestCounter>) -> anyhow::Result<()> {
    let mut ticker = interval_at(Instant::now() + TICK, TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    loop {
        ticker.tick().await;
        counter.rotate();
        counter.flush().context("persist request counter")?;
    }
}
