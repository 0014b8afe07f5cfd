use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::driver::DriverId;
use crate::models::order::OrderId;

/// Persisted offer chain of one order in `searching`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEntry {
    pub order_id: OrderId,
    pub candidate_ids: Vec<DriverId>,
    pub current_index: usize,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    /// When the current candidate was queued for an offer.
    pub queued_at: DateTime<Utc>,
    pub last_offer_sent_at: Option<DateTime<Utc>>,
}

impl DispatchEntry {
    pub fn new(
        order_id: OrderId,
        candidate_ids: Vec<DriverId>,
        payload: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id,
            candidate_ids,
            current_index: 0,
            payload,
            created_at,
            queued_at: created_at,
            last_offer_sent_at: None,
        }
    }

    pub fn current_candidate(&self) -> Option<DriverId> {
        self.candidate_ids.get(self.current_index).copied()
    }

    /// The candidate currently holding a delivered offer.
    pub fn offered_candidate(&self) -> Option<DriverId> {
        self.last_offer_sent_at.and(self.current_candidate())
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_index >= self.candidate_ids.len()
    }

    /// True when the current offer was sent before `cutoff`, or, for a stale
    /// entry that never got its offer out, when the candidate was queued before it.
    pub fn is_overdue(&self, cutoff: DateTime<Utc>) -> bool {
        match self.last_offer_sent_at {
            Some(sent_at) => sent_at < cutoff,
            None => self.queued_at < cutoff,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rejection {
    pub order_id: OrderId,
    pub driver_id: DriverId,
    pub rejected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::DispatchEntry;

    #[test]
    fn pointer_walks_off_the_end_into_exhaustion() {
        let mut entry = DispatchEntry::new(1, vec![10, 20], "{}".to_string(), Utc::now());
        assert_eq!(entry.current_candidate(), Some(10));

        entry.current_index = 2;
        assert_eq!(entry.current_candidate(), None);
        assert!(entry.is_exhausted());
    }

    #[test]
    fn stale_entries_age_from_their_queueing() {
        let created = Utc::now() - Duration::seconds(90);
        let mut entry = DispatchEntry::new(1, vec![10], "{}".to_string(), created);
        let cutoff = Utc::now() - Duration::seconds(60);

        assert!(entry.is_overdue(cutoff));

        entry.last_offer_sent_at = Some(Utc::now() - Duration::seconds(5));
        assert!(!entry.is_overdue(cutoff));
    }
}
