//! Human-readable text for notifications. One formatter per order kind, so
//! the dispatch code never branches on what is being delivered.

use std::fmt::Write;

use crate::engine::queue::{DispatchPayload, Requester};
use crate::models::order::{OrderKind, Place};
use crate::notify::{RequesterEvent, RequesterNotice};

pub fn offer_text(payload: &DispatchPayload, distance_km: Option<f64>) -> String {
    let order = &payload.order;
    let mut text = match &order.kind {
        OrderKind::Ride {
            pickup,
            destination,
        } => ride(pickup, destination),
        OrderKind::VoiceRide { recording } => voice_ride(recording),
        OrderKind::PickupDelivery {
            pickup,
            destination,
            details,
        } => pickup_delivery(pickup, destination, details),
        OrderKind::BuyDelivery {
            shopping_list,
            destination,
        } => buy_delivery(shopping_list, destination),
    };

    if let Some(distance) = distance_km {
        let _ = write!(text, "\nTo pickup: {distance:.1} km");
    }
    if let Some(at) = order.scheduled_at {
        let _ = write!(text, "\nScheduled for: {}", at.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(comment) = order.comment.as_deref().filter(|c| !c.trim().is_empty()) {
        let _ = write!(text, "\nComment: {comment}");
    }
    text.push_str(&requester_line(&payload.requester));
    text
}

fn ride(pickup: &Place, destination: &Place) -> String {
    format!(
        "New ride\nFrom: {}\nTo: {}",
        place(pickup),
        place(destination)
    )
}

fn voice_ride(recording: &str) -> String {
    format!("New ride (voice order)\nRoute in recording: {recording}")
}

fn pickup_delivery(pickup: &Place, destination: &Place, details: &str) -> String {
    format!(
        "New delivery\nPick up at: {}\nDeliver to: {}\nWhat: {details}",
        place(pickup),
        place(destination)
    )
}

fn buy_delivery(shopping_list: &str, destination: &Place) -> String {
    format!(
        "New purchase and delivery\nBuy: {shopping_list}\nDeliver to: {}",
        place(destination)
    )
}

fn place(place: &Place) -> String {
    match place {
        Place::Text { address } => address.clone(),
        Place::Voice { voice_ref } => format!("voice message {voice_ref}"),
        Place::Coordinates {
            point,
            label: Some(label),
        } => format!("{label} ({:.5}, {:.5})", point.lat, point.lng),
        Place::Coordinates { point, label: None } => {
            format!("{:.5}, {:.5}", point.lat, point.lng)
        }
    }
}

fn requester_line(requester: &Requester) -> String {
    let mut text = match (&requester.name, &requester.phone) {
        (Some(name), Some(phone)) => format!("\nClient: {name}, {phone}"),
        (Some(name), None) => format!("\nClient: {name}"),
        (None, Some(phone)) => format!("\nClient: {phone}"),
        (None, None) => String::new(),
    };

    let standing = &requester.standing;
    match standing.rating {
        Some(rating) => {
            let _ = write!(
                text,
                "\nClient rating: {rating:.1} ({} ratings)",
                standing.rating_count
            );
        }
        None => text.push_str("\nClient rating: new client"),
    }
    if !standing.recent_reviews.is_empty() {
        text.push_str("\nRecent reviews:");
        for review in &standing.recent_reviews {
            let _ = write!(text, "\n- {}/5", review.score);
            if let Some(comment) = review.comment.as_deref().filter(|c| !c.trim().is_empty()) {
                let _ = write!(text, " {}", shorten(comment, REVIEW_CHARS));
            }
        }
    }
    text
}

const REVIEW_CHARS: usize = 70;

fn shorten(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

pub fn requester_text(notice: &RequesterNotice) -> String {
    let id = notice.order_id;
    match notice.event {
        RequesterEvent::OfferAccepted => match &notice.driver {
            Some(driver) => {
                let mut text = format!("Order #{id} accepted by {}", driver.name);
                if let Some(plate) = &driver.vehicle_plate {
                    let _ = write!(text, ", vehicle {plate}");
                }
                if let Some(phone) = &driver.phone {
                    let _ = write!(text, ", phone {phone}");
                }
                if let Some(rating) = driver.rating {
                    let _ = write!(text, ", rating {rating:.1}");
                }
                text
            }
            None => format!("Order #{id} accepted"),
        },
        RequesterEvent::DriverArrived => format!("Your driver has arrived for order #{id}"),
        RequesterEvent::NoDriversAvailable => {
            format!("No drivers are available for order #{id}, it has been cancelled")
        }
        RequesterEvent::DriverCancelledRerouting => {
            format!("The driver cancelled order #{id}, looking for another one")
        }
        RequesterEvent::SearchStarted => {
            format!("It is time for scheduled order #{id}, looking for a driver")
        }
        RequesterEvent::PreorderAccepted => format!("Scheduled order #{id} has a driver"),
        RequesterEvent::PreorderReleased => {
            format!("The driver gave up scheduled order #{id}, it is open again")
        }
        RequesterEvent::Cancelled => format!("Order #{id} was cancelled"),
    }
}
