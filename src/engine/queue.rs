use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::order::{Order, RequesterId, RequesterStanding};

/// Who placed the order, as far as a driver gets to know.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Requester {
    pub id: RequesterId,
    pub name: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub standing: RequesterStanding,
}

/// Context persisted next to a candidate list so an offer can be rendered
/// again after a restart without any in-memory session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub order: Order,
    pub requester: Requester,
}

impl DispatchPayload {
    pub fn snapshot(order: &Order, standing: RequesterStanding) -> Self {
        Self {
            order: order.clone(),
            requester: Requester {
                id: order.requester_id,
                name: order.requester_name.clone(),
                phone: order.contact_phone.clone(),
                standing,
            },
        }
    }

    pub fn encode(&self) -> Result<String, AppError> {
        serde_json::to_string(self)
            .map_err(|err| AppError::Internal(format!("failed to encode dispatch payload: {err}")))
    }

    pub fn decode(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw)
            .map_err(|err| AppError::Internal(format!("corrupt dispatch payload: {err}")))
    }
}
