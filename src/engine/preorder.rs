//! Sweeps that move scheduled orders along: activation when their time has
//! come, giving up after the grace period, and the driver reminder.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::engine::coordinator::{DispatchOutcome, Dispatcher};
use crate::error::AppError;
use crate::models::order::{Order, OrderStatus};
use crate::notify::RequesterEvent;
use crate::store::OrderTransition;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PreorderSweep {
    pub activated: usize,
    pub given_up: usize,
    pub reminded: usize,
    pub expired_location_requests: usize,
}

/// Runs the three preorder sweeps plus location request cleanup. Grace goes
/// first so an order past its window is not dispatched once more.
pub async fn sweep_preorders(
    dispatcher: &Dispatcher,
    now: DateTime<Utc>,
) -> Result<PreorderSweep, AppError> {
    let started = Instant::now();
    let given_up = give_up_expired(dispatcher, now).await?;
    let activated = activate_due(dispatcher, now).await?;
    let reminded = remind_upcoming(dispatcher, now).await?;
    let expired_location_requests = dispatcher.store().purge_location_requests(now).await?;

    dispatcher
        .metrics
        .sweep_latency_seconds
        .with_label_values(&["preorders"])
        .observe(started.elapsed().as_secs_f64());

    Ok(PreorderSweep {
        activated,
        given_up,
        reminded,
        expired_location_requests,
    })
}

/// Scheduled orders whose time has arrived enter dispatch. The first
/// activation stamps `pending_dispatch_at` and tells the requester.
pub async fn activate_due(dispatcher: &Dispatcher, now: DateTime<Utc>) -> Result<usize, AppError> {
    let due = dispatcher.store().orders_due_for_activation(now).await?;
    let count = due.len();
    for_each_order(dispatcher, "activation", due, move |dispatcher, order| async move {
        activate(&dispatcher, order, now).await.map(|_| ())
    })
    .await;
    Ok(count)
}

async fn activate(
    dispatcher: &Dispatcher,
    order: Order,
    now: DateTime<Utc>,
) -> Result<DispatchOutcome, AppError> {
    if dispatcher.store().mark_pending_dispatch(order.id, now).await? {
        info!(order_id = order.id, "preorder activated");
        dispatcher
            .tell_requester(&order, RequesterEvent::SearchStarted, None)
            .await;
    }
    dispatcher.start_dispatch(order.id, None).await
}

/// Activated orders nobody took within the grace period are cancelled.
pub async fn give_up_expired(
    dispatcher: &Dispatcher,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    let cutoff = now - dispatcher.settings().pending_dispatch_grace;
    let expired = dispatcher.store().orders_past_grace(cutoff).await?;
    let count = expired.len();
    for_each_order(dispatcher, "grace", expired, move |dispatcher, order| async move {
        give_up(&dispatcher, order, now).await
    })
    .await;
    Ok(count)
}

async fn give_up(
    dispatcher: &Dispatcher,
    order: Order,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let entry = dispatcher.store().dispatch(order.id).await?;
    let give_up = OrderTransition::new(
        &[OrderStatus::Scheduled, OrderStatus::Searching],
        OrderStatus::CancelledNoDrivers,
    );
    let Some(cancelled) = dispatcher
        .store()
        .transition_order(order.id, &give_up, now)
        .await?
    else {
        return Ok(());
    };
    dispatcher.store().remove_dispatch(order.id).await?;
    dispatcher.metrics.outcome("grace_expired");
    info!(order_id = order.id, "preorder not taken within grace period");

    if let Some(driver_id) = entry.and_then(|entry| entry.offered_candidate()) {
        dispatcher.release_driver(driver_id, order.id).await;
    }
    dispatcher
        .tell_requester(&cancelled, RequesterEvent::NoDriversAvailable, None)
        .await;
    Ok(())
}

/// Reminds drivers of accepted preorders coming up within the lead time.
/// The flag is claimed before sending and handed back if delivery fails, so
/// a reminder goes out once and is retried until it does.
pub async fn remind_upcoming(
    dispatcher: &Dispatcher,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    let horizon = now + dispatcher.settings().preorder_reminder_lead;
    let upcoming = dispatcher.store().preorders_due_for_reminder(horizon).await?;
    let count = upcoming.len();
    for_each_order(dispatcher, "reminder", upcoming, |dispatcher, order| async move {
        remind(&dispatcher, order).await
    })
    .await;
    Ok(count)
}

async fn remind(dispatcher: &Dispatcher, order: Order) -> Result<(), AppError> {
    let Some(driver_id) = order.assigned_driver else {
        return Ok(());
    };
    if !dispatcher.store().swap_reminder_sent(order.id, false).await? {
        return Ok(());
    }

    match dispatcher
        .notifier
        .notify_driver_reminder(driver_id, &order)
        .await
    {
        Ok(()) => {
            info!(order_id = order.id, driver_id, "preorder reminder sent");
            Ok(())
        }
        Err(err) => {
            dispatcher.notification_failed("driver", order.id, &err);
            dispatcher.store().swap_reminder_sent(order.id, true).await?;
            Ok(())
        }
    }
}

async fn for_each_order<F, Fut>(
    dispatcher: &Dispatcher,
    sweep: &'static str,
    orders: Vec<Order>,
    work: F,
) where
    F: Fn(Dispatcher, Order) -> Fut,
    Fut: Future<Output = Result<(), AppError>> + Send + 'static,
{
    dispatcher
        .metrics
        .sweep_items_total
        .with_label_values(&[sweep])
        .inc_by(orders.len() as u64);

    let mut tasks = JoinSet::new();
    for order in orders {
        let order_id = order.id;
        let fut = work(dispatcher.clone(), order);
        tasks.spawn(async move { (order_id, fut.await) });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((order_id, Err(err))) => {
                error!(order_id, sweep, error = %err, "preorder sweep item failed");
            }
            Err(err) => error!(sweep, error = %err, "preorder sweep task panicked"),
        }
    }
}

pub async fn run_preorder_sweeper(
    dispatcher: Dispatcher,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(period_secs = period.as_secs(), "preorder sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sweep_preorders(&dispatcher, Utc::now()).await {
                    Ok(sweep) if sweep == PreorderSweep::default() => {}
                    Ok(sweep) => info!(?sweep, "preorder sweep finished"),
                    Err(err) => warn!(error = %err, "preorder sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("preorder sweeper stopped");
                break;
            }
        }
    }
}
