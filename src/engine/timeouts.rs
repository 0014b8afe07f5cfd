use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::engine::coordinator::Dispatcher;
use crate::error::AppError;

/// One pass over the dispatch queue: every offer older than the accept
/// window, and every candidate queued that long without an offer, is handled
/// like a rejection. Entries are processed concurrently and one failing entry
/// does not affect the rest.
pub async fn sweep_timeouts(
    dispatcher: &Dispatcher,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    let started = Instant::now();
    let cutoff = now - dispatcher.settings().accept_window;
    let overdue = dispatcher.store().overdue_dispatches(cutoff).await?;
    let count = overdue.len();

    let mut tasks = JoinSet::new();
    for entry in overdue {
        let dispatcher = dispatcher.clone();
        tasks.spawn(async move {
            let result = dispatcher.expire_offer(&entry, now).await;
            (entry.order_id, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(_))) => {}
            Ok((order_id, Err(err))) => {
                error!(order_id, error = %err, "failed to expire offer");
            }
            Err(err) => error!(error = %err, "timeout task panicked"),
        }
    }

    let metrics = &dispatcher.metrics;
    metrics
        .sweep_latency_seconds
        .with_label_values(&["timeouts"])
        .observe(started.elapsed().as_secs_f64());
    metrics
        .sweep_items_total
        .with_label_values(&["timeouts"])
        .inc_by(count as u64);

    Ok(count)
}

pub async fn run_timeout_sweeper(
    dispatcher: Dispatcher,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(period_secs = period.as_secs(), "timeout sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sweep_timeouts(&dispatcher, Utc::now()).await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "timed out offers handled"),
                    Err(err) => error!(error = %err, "timeout sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("timeout sweeper stopped");
                break;
            }
        }
    }
}
