use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    db::DbPool,
    error::TripError,
    models::{
        settlement::{Settlement, SettlementRequest},
        trip::Trip,
    },
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unreachable: {0}")]
    Unreachable(String),
    #[error("ledger rejected settlement: {0}")]
    Rejected(String),
}

/// Intake side of the external ledger.
///
/// Implementations must treat a repeated `trip_id` as the same request.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn submit(&self, request: &SettlementRequest) -> Result<(), LedgerError>;
}

/// Drops settlement requests into the `ledger_intake` table the ledger
/// service consumes.
#[derive(Clone)]
pub struct OutboxLedger {
    db: DbPool,
}

impl OutboxLedger {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Ledger for OutboxLedger {
    async fn submit(&self, request: &SettlementRequest) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT OR IGNORE INTO ledger_intake (trip_id, driver_id, price, received_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&request.trip_id)
        .bind(&request.driver_id)
        .bind(request.price)
        .bind(Utc::now())
        .execute(&self.db)
        .await
        .map_err(|err| LedgerError::Unreachable(err.to_string()))?;
        Ok(())
    }
}

/// Hands completed trips to the ledger.
///
/// The settlement row is written together with the completion itself, so a
/// failed or interrupted hand-off is picked up again by
/// [`SettlementHook::retry_outstanding`].
#[derive(Clone)]
pub struct SettlementHook {
    db: DbPool,
    ledger: Arc<dyn Ledger>,
    grace: Duration,
}

impl SettlementHook {
    pub fn new(db: DbPool, ledger: Arc<dyn Ledger>, grace: Duration) -> Self {
        Self { db, ledger, grace }
    }

    pub async fn on_completed(&self, trip: &Trip) -> Result<(), TripError> {
        let Some(driver_id) = trip.driver_id.clone() else {
            warn!(trip_id = %trip.id, "completed trip has no driver, nothing to settle");
            return Ok(());
        };
        let request = SettlementRequest {
            trip_id: trip.id.clone(),
            driver_id,
            price: trip.price,
        };
        self.forward(&request).await
    }

    async fn forward(&self, request: &SettlementRequest) -> Result<(), TripError> {
        match self.ledger.submit(request).await {
            Ok(()) => {
                sqlx::query(
                    "UPDATE settlements SET state = 'settled', attempts = attempts + 1, last_error = NULL, settled_at = ? WHERE trip_id = ? AND state != 'settled'",
                )
                .bind(Utc::now())
                .bind(&request.trip_id)
                .execute(&self.db)
                .await?;
                info!(trip_id = %request.trip_id, driver_id = %request.driver_id, price = request.price, "settlement handed to ledger");
            }
            Err(err) => {
                warn!(trip_id = %request.trip_id, error = %err, "settlement failed, queued for retry");
                sqlx::query(
                    "UPDATE settlements SET state = 'failed', attempts = attempts + 1, last_error = ? WHERE trip_id = ? AND state != 'settled'",
                )
                .bind(err.to_string())
                .bind(&request.trip_id)
                .execute(&self.db)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn get(&self, trip_id: &str) -> Result<Option<Settlement>, TripError> {
        let settlement =
            sqlx::query_as::<_, Settlement>("SELECT * FROM settlements WHERE trip_id = ?")
                .bind(trip_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(settlement)
    }

    /// Settlements that failed, or that stayed pending past the grace period.
    pub async fn outstanding(&self) -> Result<Vec<Settlement>, TripError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.grace).unwrap_or_else(|_| chrono::Duration::zero());
        let settlements = sqlx::query_as::<_, Settlement>(
            r#"SELECT * FROM settlements
               WHERE state = 'failed' OR (state = 'pending' AND requested_at <= ?)
               ORDER BY requested_at ASC"#,
        )
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;
        Ok(settlements)
    }

    /// Re-forwards every outstanding settlement. Returns how many were tried.
    pub async fn retry_outstanding(&self) -> Result<usize, TripError> {
        let outstanding = self.outstanding().await?;
        for settlement in &outstanding {
            self.forward(&settlement.request()).await?;
        }
        Ok(outstanding.len())
    }

    pub fn spawn_retry_loop(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.retry_outstanding().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "settlement retry sweep finished"),
                    Err(err) => warn!(error = %err, "settlement retry sweep failed"),
                }
            }
        })
    }
}

