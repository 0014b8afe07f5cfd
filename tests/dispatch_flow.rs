use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use fleet_dispatch::config::DispatchSettings;
use fleet_dispatch::engine::preorder::{remind_upcoming, sweep_preorders};
use fleet_dispatch::engine::queue::DispatchPayload;
use fleet_dispatch::engine::ranking::rank;
use fleet_dispatch::engine::timeouts::sweep_timeouts;
use fleet_dispatch::engine::{DispatchOutcome, Dispatcher, DriverCancelOutcome, RejectOutcome};
use fleet_dispatch::error::{AppError, NotificationError};
use fleet_dispatch::models::dispatch::DispatchEntry;
use fleet_dispatch::models::driver::{Driver, DriverId, GeoPoint};
use fleet_dispatch::models::order::{
    NewOrder, Order, OrderFilter, OrderId, OrderKind, OrderRating, OrderStatus, Place,
    RequesterId, RequesterStanding,
};
use fleet_dispatch::notify::{Notifier, Offer, RequesterEvent, RequesterNotice};
use fleet_dispatch::observability::metrics::Metrics;
use fleet_dispatch::store::{MemoryStore, OrderTransition, Store};

const REQUESTER: RequesterId = 500;

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Offer { driver: DriverId, order: OrderId },
    Requester { order: OrderId, event: RequesterEvent },
    Timeout { driver: DriverId, order: OrderId },
    Reminder { driver: DriverId, order: OrderId },
    Released { driver: DriverId, order: OrderId },
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
    unreachable: Mutex<HashSet<DriverId>>,
    fail_reminders: AtomicBool,
}

impl RecordingNotifier {
    fn record(&self, sent: Sent) {
        self.sent.lock().unwrap().push(sent);
    }

    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn make_unreachable(&self, driver: DriverId) {
        self.unreachable.lock().unwrap().insert(driver);
    }

    fn offers_to(&self, driver: DriverId) -> usize {
        self.sent()
            .iter()
            .filter(|sent| matches!(sent, Sent::Offer { driver: d, .. } if *d == driver))
            .count()
    }

    fn requester_events(&self, order_id: OrderId) -> Vec<RequesterEvent> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Requester { order, event } if order == order_id => Some(event),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_driver_offer(
        &self,
        driver_id: DriverId,
        offer: &Offer,
    ) -> Result<(), NotificationError> {
        if self.unreachable.lock().unwrap().contains(&driver_id) {
            return Err(NotificationError::Unreachable(driver_id));
        }
        self.record(Sent::Offer {
            driver: driver_id,
            order: offer.order_id,
        });
        Ok(())
    }

    async fn notify_requester(
        &self,
        _requester_id: RequesterId,
        notice: &RequesterNotice,
    ) -> Result<(), NotificationError> {
        self.record(Sent::Requester {
            order: notice.order_id,
            event: notice.event,
        });
        Ok(())
    }

    async fn notify_driver_timeout(
        &self,
        driver_id: DriverId,
        order_id: OrderId,
    ) -> Result<(), NotificationError> {
        self.record(Sent::Timeout {
            driver: driver_id,
            order: order_id,
        });
        Ok(())
    }

    async fn notify_driver_reminder(
        &self,
        driver_id: DriverId,
        order: &Order,
    ) -> Result<(), NotificationError> {
        if self.fail_reminders.load(Ordering::SeqCst) {
            return Err(NotificationError::Transport("bot blocked".to_string()));
        }
        self.record(Sent::Reminder {
            driver: driver_id,
            order: order.id,
        });
        Ok(())
    }

    async fn notify_driver_released(
        &self,
        driver_id: DriverId,
        order_id: OrderId,
    ) -> Result<(), NotificationError> {
        self.record(Sent::Released {
            driver: driver_id,
            order: order_id,
        });
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    metrics: Metrics,
    dispatcher: Dispatcher,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let metrics = Metrics::new();
    let dispatcher = Dispatcher::new(
        store.clone(),
        notifier.clone(),
        metrics.clone(),
        DispatchSettings::default(),
    );
    Harness {
        store,
        notifier,
        metrics,
        dispatcher,
    }
}

async fn add_driver(store: &MemoryStore, id: DriverId, position: Option<(f64, f64)>) {
    store
        .upsert_driver(Driver::new(id, format!("driver-{id}")))
        .await
        .unwrap();
    store.set_shift(id, true, Utc::now()).await.unwrap();
    if let Some((lat, lng)) = position {
        store
            .set_position(id, GeoPoint { lat, lng })
            .await
            .unwrap();
    }
}

fn ride_from(point: Option<(f64, f64)>) -> NewOrder {
    NewOrder {
        requester_id: REQUESTER,
        requester_name: Some("Natalia".to_string()),
        contact_phone: Some("+380501234567".to_string()),
        kind: OrderKind::Ride {
            pickup: Place::Text {
                address: "Pokrovska square".to_string(),
            },
            destination: Place::Text {
                address: "Railway station".to_string(),
            },
        },
        comment: None,
        location: point.map(|(lat, lng)| GeoPoint { lat, lng }),
        scheduled_at: None,
    }
}

fn order_point() -> Option<(f64, f64)> {
    Some((50.90, 34.80))
}

async fn status_of(store: &MemoryStore, order_id: OrderId) -> OrderStatus {
    store.order(order_id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn rejected_and_silent_candidates_exhaust_the_order() {
    let h = harness();
    let (a, b, c) = (10, 20, 5);
    add_driver(&h.store, a, Some((50.91, 34.81))).await;
    add_driver(&h.store, b, Some((50.50, 34.00))).await;
    add_driver(&h.store, c, None).await;

    let drivers = h.store.drivers().await.unwrap();
    let point = order_point().map(|(lat, lng)| GeoPoint { lat, lng });
    assert_eq!(rank(point, &HashSet::new(), &drivers), vec![a, b, c]);

    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();
    assert_eq!(order.status, OrderStatus::Searching);
    assert_eq!(h.notifier.offers_to(a), 1);

    assert_eq!(
        h.dispatcher.reject(order.id, a).await.unwrap(),
        RejectOutcome::Advanced {
            next: DispatchOutcome::Offered { driver_id: b }
        }
    );
    assert_eq!(
        h.dispatcher.reject(order.id, b).await.unwrap(),
        RejectOutcome::Advanced {
            next: DispatchOutcome::Offered { driver_id: c }
        }
    );
    let entry = h.store.dispatch(order.id).await.unwrap().unwrap();
    assert_eq!(entry.current_index, 2);
    assert!(entry.last_offer_sent_at.is_some());

    // still within the accept window
    assert_eq!(sweep_timeouts(&h.dispatcher, Utc::now()).await.unwrap(), 0);

    let later = Utc::now() + Duration::seconds(61);
    assert_eq!(sweep_timeouts(&h.dispatcher, later).await.unwrap(), 1);

    let order = h.store.order(order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::CancelledNoDrivers);
    assert_eq!(order.assigned_driver, None);
    assert!(h.store.dispatch(order.id).await.unwrap().is_none());

    let mut rejected = h.store.rejected_drivers(order.id).await.unwrap();
    rejected.sort();
    assert_eq!(rejected, vec![c, a, b]);

    assert!(h.notifier.sent().contains(&Sent::Timeout {
        driver: c,
        order: order.id
    }));
    assert_eq!(
        h.notifier.requester_events(order.id).last(),
        Some(&RequesterEvent::NoDriversAvailable)
    );
}

#[tokio::test]
async fn first_accept_wins_and_duplicates_are_turned_away() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 40, Some((50.95, 34.85))).await;

    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();
    let accepted = h.dispatcher.accept(order.id, 10).await.unwrap();
    assert_eq!(accepted.status, OrderStatus::Accepted);
    assert_eq!(accepted.assigned_driver, Some(10));
    assert!(h.store.dispatch(order.id).await.unwrap().is_none());
    assert!(
        h.notifier
            .requester_events(order.id)
            .contains(&RequesterEvent::OfferAccepted)
    );

    let duplicate = h.dispatcher.accept(order.id, 40).await;
    assert!(matches!(duplicate, Err(AppError::NoLongerAvailable(id)) if id == order.id));
    let order = h.store.order(order.id).await.unwrap().unwrap();
    assert_eq!(order.assigned_driver, Some(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accepts_have_exactly_one_winner() {
    let h = harness();
    for id in 1..=8 {
        add_driver(&h.store, id, Some((50.90 + id as f64 * 0.01, 34.80))).await;
    }
    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();

    let mut handles = Vec::new();
    for driver_id in 1..=8 {
        let dispatcher = h.dispatcher.clone();
        handles.push(tokio::spawn(async move {
            (driver_id, dispatcher.accept(order.id, driver_id).await)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (driver_id, result) = handle.await.unwrap();
        match result {
            Ok(_) => winners.push(driver_id),
            Err(err) => assert!(matches!(err, AppError::NoLongerAvailable(_))),
        }
    }

    assert_eq!(winners.len(), 1);
    let order = h.store.order(order.id).await.unwrap().unwrap();
    assert_eq!(order.assigned_driver, Some(winners[0]));
}

#[tokio::test]
async fn driver_cancellation_reroutes_without_that_driver() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, Some((50.50, 34.00))).await;

    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();
    h.dispatcher.accept(order.id, 10).await.unwrap();

    assert_eq!(
        h.dispatcher.cancel_by_driver(order.id, 20).await.unwrap(),
        DriverCancelOutcome::NotApplicable
    );

    assert_eq!(
        h.dispatcher.cancel_by_driver(order.id, 10).await.unwrap(),
        DriverCancelOutcome::Rerouted {
            next: DispatchOutcome::Offered { driver_id: 20 }
        }
    );

    let rerouted = h.store.order(order.id).await.unwrap().unwrap();
    assert_eq!(rerouted.status, OrderStatus::Searching);
    assert_eq!(rerouted.assigned_driver, None);
    assert_eq!(h.store.rejected_drivers(order.id).await.unwrap(), vec![10]);

    let entry = h.store.dispatch(order.id).await.unwrap().unwrap();
    assert_eq!(entry.candidate_ids, vec![20]);
    assert_eq!(entry.current_index, 0);
    assert!(
        h.notifier
            .requester_events(order.id)
            .contains(&RequesterEvent::DriverCancelledRerouting)
    );

    assert_eq!(
        h.dispatcher.cancel_by_driver(order.id, 10).await.unwrap(),
        DriverCancelOutcome::NotApplicable
    );
}

#[tokio::test]
async fn only_the_current_candidate_can_reject() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, Some((50.50, 34.00))).await;
    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();

    assert_eq!(
        h.dispatcher.reject(order.id, 20).await.unwrap(),
        RejectOutcome::NotCurrentCandidate
    );
    assert_eq!(
        h.store.dispatch(order.id).await.unwrap().unwrap().current_index,
        0
    );

    h.dispatcher.reject(order.id, 10).await.unwrap();
    assert_eq!(
        h.dispatcher.reject(order.id, 10).await.unwrap(),
        RejectOutcome::NotCurrentCandidate
    );
    assert_eq!(h.notifier.offers_to(20), 1);
}

#[tokio::test]
async fn unreachable_drivers_are_skipped_immediately() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, Some((50.50, 34.00))).await;
    h.notifier.make_unreachable(10);

    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();

    assert_eq!(order.status, OrderStatus::Searching);
    assert_eq!(h.notifier.offers_to(10), 0);
    assert_eq!(h.notifier.offers_to(20), 1);
    assert_eq!(h.store.rejected_drivers(order.id).await.unwrap(), vec![10]);
    assert_eq!(
        h.store.dispatch(order.id).await.unwrap().unwrap().current_index,
        1
    );
    assert_eq!(
        h.metrics
            .offers_total
            .with_label_values(&["unreachable"])
            .get(),
        1
    );
}

#[tokio::test]
async fn nobody_reachable_ends_in_no_drivers() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, None).await;
    h.notifier.make_unreachable(10);
    h.notifier.make_unreachable(20);

    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();

    assert_eq!(order.status, OrderStatus::CancelledNoDrivers);
    assert!(h.store.dispatch(order.id).await.unwrap().is_none());
    assert_eq!(
        h.notifier.requester_events(order.id),
        vec![RequesterEvent::NoDriversAvailable]
    );
}

#[tokio::test]
async fn empty_directory_cancels_right_away() {
    let h = harness();
    let order = h.dispatcher.create_order(ride_from(None)).await.unwrap();

    assert_eq!(order.status, OrderStatus::CancelledNoDrivers);
    assert!(h.store.dispatch(order.id).await.unwrap().is_none());
    assert_eq!(
        h.notifier.requester_events(order.id),
        vec![RequesterEvent::NoDriversAvailable]
    );
}

#[tokio::test]
async fn never_offered_entry_is_recovered_like_a_timeout() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, Some((50.50, 34.00))).await;

    // what a crash between queueing and sending leaves behind
    let queued_at = Utc::now() - Duration::seconds(120);
    let order = h
        .store
        .insert_order(ride_from(order_point()), queued_at)
        .await
        .unwrap();
    let to_searching =
        OrderTransition::new(&[OrderStatus::PendingCreation], OrderStatus::Searching);
    h.store
        .transition_order(order.id, &to_searching, queued_at)
        .await
        .unwrap()
        .unwrap();
    let payload = DispatchPayload::snapshot(&order, RequesterStanding::default())
        .encode()
        .unwrap();
    h.store
        .put_dispatch(DispatchEntry::new(order.id, vec![10, 20], payload, queued_at))
        .await
        .unwrap();

    assert_eq!(sweep_timeouts(&h.dispatcher, Utc::now()).await.unwrap(), 1);

    let entry = h.store.dispatch(order.id).await.unwrap().unwrap();
    assert_eq!(entry.current_index, 1);
    assert!(entry.last_offer_sent_at.is_some());
    assert_eq!(h.store.rejected_drivers(order.id).await.unwrap(), vec![10]);
    assert_eq!(h.notifier.offers_to(10), 0);
    assert_eq!(h.notifier.offers_to(20), 1);
    assert!(
        !h.notifier
            .sent()
            .iter()
            .any(|sent| matches!(sent, Sent::Timeout { .. }))
    );

    // the fresh candidate is not stale
    assert_eq!(sweep_timeouts(&h.dispatcher, Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn trip_runs_to_completion_and_is_rated_once() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, None).await;
    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();
    h.dispatcher.accept(order.id, 10).await.unwrap();

    let wrong_driver = h.dispatcher.mark_arrived(order.id, 20).await;
    assert!(matches!(wrong_driver, Err(AppError::NoLongerAvailable(_))));
    h.dispatcher.mark_arrived(order.id, 10).await.unwrap();
    assert!(
        h.notifier
            .requester_events(order.id)
            .contains(&RequesterEvent::DriverArrived)
    );

    let started = h.dispatcher.start_trip(order.id, 10).await.unwrap();
    assert_eq!(started.status, OrderStatus::InProgress);
    let done = h.dispatcher.complete(order.id, 10).await.unwrap();
    assert_eq!(done.status, OrderStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.assigned_driver, Some(10));

    let five = |comment: Option<&str>| OrderRating {
        score: 5,
        comment: comment.map(str::to_string),
    };
    assert!(matches!(
        h.dispatcher.rate(order.id, 999, five(None)).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        h.dispatcher
            .rate(
                order.id,
                REQUESTER,
                OrderRating {
                    score: 6,
                    comment: None
                }
            )
            .await,
        Err(AppError::BadRequest(_))
    ));

    let rated = h
        .dispatcher
        .rate(order.id, REQUESTER, five(Some("smooth ride")))
        .await
        .unwrap();
    assert_eq!(rated.rating.map(|r| r.score), Some(5));
    assert!(matches!(
        h.dispatcher.rate(order.id, REQUESTER, five(None)).await,
        Err(AppError::Conflict(_))
    ));

    let driver = h.store.driver(10).await.unwrap().unwrap();
    assert_eq!(driver.rating_count, 1);
    assert!((driver.rating - 5.0).abs() < 1e-9);
}

#[tokio::test]
async fn expiry_overtaken_by_an_accept_leaves_the_driver_alone() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, Some((50.50, 34.00))).await;
    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();

    // the sweep picked the entry up just before the driver answered
    let swept = h.store.dispatch(order.id).await.unwrap().unwrap();
    h.dispatcher.accept(order.id, 10).await.unwrap();

    let later = Utc::now() + Duration::seconds(61);
    assert_eq!(
        h.dispatcher.expire_offer(&swept, later).await.unwrap(),
        DispatchOutcome::Resolved
    );

    let order = h.store.order(order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Accepted);
    assert_eq!(order.assigned_driver, Some(10));
    assert!(h.store.rejected_drivers(order.id).await.unwrap().is_empty());
    assert!(h.store.rejections_by_driver(10).await.unwrap().is_empty());
    assert!(!h.notifier.sent().contains(&Sent::Timeout {
        driver: 10,
        order: order.id
    }));
}

#[tokio::test]
async fn expiry_overtaken_by_a_reject_does_not_skip_the_next_driver() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, Some((50.50, 34.00))).await;
    add_driver(&h.store, 30, Some((50.20, 33.90))).await;
    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();

    let swept = h.store.dispatch(order.id).await.unwrap().unwrap();
    h.dispatcher.reject(order.id, 10).await.unwrap();
    let later = Utc::now() + Duration::seconds(61);
    assert_eq!(
        h.dispatcher.expire_offer(&swept, later).await.unwrap(),
        DispatchOutcome::Resolved
    );

    let entry = h.store.dispatch(order.id).await.unwrap().unwrap();
    assert_eq!(entry.current_index, 1);
    assert_eq!(entry.current_candidate(), Some(20));
    assert!(entry.last_offer_sent_at.is_some());
    assert_eq!(h.notifier.offers_to(30), 0);
    assert!(
        !h.notifier
            .sent()
            .iter()
            .any(|sent| matches!(sent, Sent::Timeout { .. }))
    );
}

async fn completed_trip(h: &Harness, driver_id: DriverId) -> Order {
    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();
    h.dispatcher.accept(order.id, driver_id).await.unwrap();
    h.dispatcher.complete(order.id, driver_id).await.unwrap()
}

#[tokio::test]
async fn drivers_rate_the_client_and_later_offers_show_it() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, Some((50.50, 34.00))).await;

    let first = completed_trip(&h, 10).await;
    let review = OrderRating {
        score: 3,
        comment: Some("kept me waiting".to_string()),
    };
    assert!(matches!(
        h.dispatcher.rate_requester(first.id, 20, review.clone()).await,
        Err(AppError::NotFound(_))
    ));
    let rated = h
        .dispatcher
        .rate_requester(first.id, 10, review.clone())
        .await
        .unwrap();
    assert_eq!(rated.requester_rating, Some(review.clone()));
    assert!(rated.rating.is_none());
    assert!(matches!(
        h.dispatcher.rate_requester(first.id, 10, review).await,
        Err(AppError::Conflict(_))
    ));

    let open = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();
    assert!(matches!(
        h.dispatcher
            .rate_requester(
                open.id,
                10,
                OrderRating {
                    score: 5,
                    comment: None
                }
            )
            .await,
        Err(AppError::NotFound(_))
    ));

    let standing = h.dispatcher.requester_standing(REQUESTER).await.unwrap();
    assert_eq!(standing.rating, Some(3.0));
    assert_eq!(standing.rating_count, 1);

    let entry = h.store.dispatch(open.id).await.unwrap().unwrap();
    let payload = DispatchPayload::decode(&entry.payload).unwrap();
    assert_eq!(payload.requester.standing, standing);
}

#[tokio::test]
async fn trip_history_is_listed_per_driver_and_client_newest_first() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, Some((50.50, 34.00))).await;

    let first = completed_trip(&h, 10).await;
    let second = completed_trip(&h, 20).await;
    let third = completed_trip(&h, 10).await;

    let of_driver = |driver_id| OrderFilter {
        status: Some(OrderStatus::Completed),
        driver_id: Some(driver_id),
        ..OrderFilter::default()
    };
    let ids = |orders: Vec<Order>| orders.into_iter().map(|o| o.id).collect::<Vec<_>>();

    assert_eq!(
        ids(h.store.orders(of_driver(10)).await.unwrap()),
        vec![third.id, first.id]
    );
    assert_eq!(
        ids(h.store.orders(of_driver(20)).await.unwrap()),
        vec![second.id]
    );

    let page = OrderFilter {
        requester_id: Some(REQUESTER),
        limit: Some(2),
        offset: 1,
        ..OrderFilter::default()
    };
    assert_eq!(
        ids(h.store.orders(page).await.unwrap()),
        vec![second.id, first.id]
    );
    let stranger = OrderFilter {
        requester_id: Some(REQUESTER + 1),
        ..OrderFilter::default()
    };
    assert!(h.store.orders(stranger).await.unwrap().is_empty());
}

#[tokio::test]
async fn abandoned_trip_is_not_redispatched() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, Some((50.50, 34.00))).await;
    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();
    h.dispatcher.accept(order.id, 10).await.unwrap();
    h.dispatcher.start_trip(order.id, 10).await.unwrap();

    // a started trip cannot be handed back
    assert_eq!(
        h.dispatcher.cancel_by_driver(order.id, 10).await.unwrap(),
        DriverCancelOutcome::NotApplicable
    );

    let abandoned = h.dispatcher.abandon_trip(order.id, 10).await.unwrap();
    assert_eq!(abandoned.status, OrderStatus::CancelledByDriver);
    assert_eq!(abandoned.assigned_driver, None);
    assert_eq!(h.notifier.offers_to(20), 0);
    assert_eq!(
        h.notifier.requester_events(order.id).last(),
        Some(&RequesterEvent::Cancelled)
    );
}

#[tokio::test]
async fn requester_cancel_releases_the_offered_driver() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();

    assert!(matches!(
        h.dispatcher.cancel_by_user(order.id, 777).await,
        Err(AppError::NotFound(_))
    ));

    let cancelled = h.dispatcher.cancel_by_user(order.id, REQUESTER).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::CancelledByUser);
    assert!(h.store.dispatch(order.id).await.unwrap().is_none());
    assert!(h.notifier.sent().contains(&Sent::Released {
        driver: 10,
        order: order.id
    }));

    assert!(matches!(
        h.dispatcher.accept(order.id, 10).await,
        Err(AppError::NoLongerAvailable(_))
    ));
    assert!(matches!(
        h.dispatcher.cancel_by_user(order.id, REQUESTER).await,
        Err(AppError::Conflict(_))
    ));
}

#[tokio::test]
async fn reassignment_supersedes_the_offer_chain() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    add_driver(&h.store, 20, Some((50.50, 34.00))).await;
    h.store.upsert_driver(Driver::new(30, "off duty")).await.unwrap();
    let order = h.dispatcher.create_order(ride_from(order_point())).await.unwrap();

    assert!(matches!(
        h.dispatcher.reassign(order.id, 30).await,
        Err(AppError::Conflict(_))
    ));

    let reassigned = h.dispatcher.reassign(order.id, 20).await.unwrap();
    assert_eq!(reassigned.status, OrderStatus::Accepted);
    assert_eq!(reassigned.assigned_driver, Some(20));
    assert!(h.store.dispatch(order.id).await.unwrap().is_none());

    assert!(matches!(
        h.dispatcher.accept(order.id, 10).await,
        Err(AppError::NoLongerAvailable(_))
    ));

    let moved_again = h.dispatcher.reassign(order.id, 10).await.unwrap();
    assert_eq!(moved_again.assigned_driver, Some(10));
    assert!(h.notifier.sent().contains(&Sent::Released {
        driver: 20,
        order: order.id
    }));
}

#[tokio::test]
async fn preorder_is_claimed_reminded_once_and_released() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    let now = Utc::now();

    let mut new_order = ride_from(order_point());
    new_order.scheduled_at = Some(now + Duration::hours(1));
    let order = h.dispatcher.create_order(new_order).await.unwrap();
    assert_eq!(order.status, OrderStatus::Scheduled);
    assert_eq!(h.notifier.offers_to(10), 0);

    let claimed = h.dispatcher.accept_preorder(order.id, 10).await.unwrap();
    assert_eq!(claimed.status, OrderStatus::AcceptedPreorder);
    assert!(
        h.notifier
            .requester_events(order.id)
            .contains(&RequesterEvent::PreorderAccepted)
    );

    // too early for a reminder
    let sweep = sweep_preorders(&h.dispatcher, now).await.unwrap();
    assert_eq!(sweep.reminded, 0);

    let sweep = sweep_preorders(&h.dispatcher, now + Duration::minutes(31)).await.unwrap();
    assert_eq!(sweep.reminded, 1);
    let sweep = sweep_preorders(&h.dispatcher, now + Duration::minutes(32)).await.unwrap();
    assert_eq!(sweep.reminded, 0);
    let reminders = h
        .notifier
        .sent()
        .into_iter()
        .filter(|sent| matches!(sent, Sent::Reminder { .. }))
        .count();
    assert_eq!(reminders, 1);

    assert!(matches!(
        h.dispatcher.release_preorder(order.id, 99).await,
        Err(AppError::NoLongerAvailable(_))
    ));
    let released = h.dispatcher.release_preorder(order.id, 10).await.unwrap();
    assert_eq!(released.status, OrderStatus::Scheduled);
    assert_eq!(released.assigned_driver, None);
    assert!(!released.reminder_sent);
}

#[tokio::test]
async fn failed_reminder_is_retried_on_the_next_pass() {
    let h = harness();
    add_driver(&h.store, 10, None).await;
    let now = Utc::now();

    let mut new_order = ride_from(None);
    new_order.scheduled_at = Some(now + Duration::minutes(20));
    let order = h.dispatcher.create_order(new_order).await.unwrap();
    h.dispatcher.accept_preorder(order.id, 10).await.unwrap();

    h.notifier.fail_reminders.store(true, Ordering::SeqCst);
    remind_upcoming(&h.dispatcher, now).await.unwrap();
    assert!(!h.store.order(order.id).await.unwrap().unwrap().reminder_sent);
    assert_eq!(
        h.metrics
            .notifications_failed_total
            .with_label_values(&["driver"])
            .get(),
        1
    );

    h.notifier.fail_reminders.store(false, Ordering::SeqCst);
    remind_upcoming(&h.dispatcher, now).await.unwrap();
    assert!(h.store.order(order.id).await.unwrap().unwrap().reminder_sent);
    assert!(h.notifier.sent().contains(&Sent::Reminder {
        driver: 10,
        order: order.id
    }));
}

#[tokio::test]
async fn activated_preorder_waits_for_supply_then_gives_up() {
    let h = harness();
    let now = Utc::now();
    let mut new_order = ride_from(order_point());
    new_order.scheduled_at = Some(now + Duration::hours(1));
    let order = h.dispatcher.create_order(new_order).await.unwrap();

    let activated_at = now + Duration::minutes(61);
    let sweep = sweep_preorders(&h.dispatcher, activated_at).await.unwrap();
    assert_eq!(sweep.activated, 1);
    let held = h.store.order(order.id).await.unwrap().unwrap();
    assert_eq!(held.status, OrderStatus::Scheduled);
    assert_eq!(held.pending_dispatch_at, Some(activated_at));

    let sweep = sweep_preorders(&h.dispatcher, activated_at + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(sweep.given_up, 0);
    assert_eq!(status_of(&h.store, order.id).await, OrderStatus::Scheduled);

    let sweep = sweep_preorders(&h.dispatcher, activated_at + Duration::minutes(16))
        .await
        .unwrap();
    assert_eq!(sweep.given_up, 1);
    assert_eq!(
        status_of(&h.store, order.id).await,
        OrderStatus::CancelledNoDrivers
    );
    assert_eq!(
        h.notifier.requester_events(order.id),
        vec![
            RequesterEvent::SearchStarted,
            RequesterEvent::NoDriversAvailable
        ]
    );
}

#[tokio::test]
async fn activated_preorder_with_supply_is_offered() {
    let h = harness();
    add_driver(&h.store, 10, Some((50.91, 34.81))).await;
    let now = Utc::now();
    let mut new_order = ride_from(order_point());
    new_order.scheduled_at = Some(now + Duration::hours(1));
    let order = h.dispatcher.create_order(new_order).await.unwrap();

    let sweep = sweep_preorders(&h.dispatcher, now + Duration::minutes(61))
        .await
        .unwrap();
    assert_eq!(sweep.activated, 1);
    assert_eq!(status_of(&h.store, order.id).await, OrderStatus::Searching);
    assert_eq!(h.notifier.offers_to(10), 1);
}
