use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Payload handed to the ledger collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub trip_id: String,
    pub driver_id: String,
    pub price: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SettlementState {
    Pending,
    Settled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Settlement {
    pub trip_id: String,
    pub driver_id: String,
    pub price: i64,
    pub state: SettlementState,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Settlement {
    pub fn request(&self) -> SettlementRequest {
        SettlementRequest {
            trip_id: self.trip_id.clone(),
            driver_id: self.driver_id.clone(),
            price: self.price,
        }
    }
}
