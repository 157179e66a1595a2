use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    db::DbPool,
    error::TripError,
    models::{
        event::TripChange,
        trip::{Trip, TripStatus},
    },
};

/// Receiving end of the store's change notifications.
pub type ChangeFeed = mpsc::UnboundedReceiver<TripChange>;

const ACTIVE_STATUSES: &str = "('accepted', 'arrived_pickup', 'in_transit', 'arrived_dropoff')";

/// Durable trip records.
///
/// Every mutation is a single conditional statement, so correctness does not
/// depend on which process issues it. Each committed write bumps `revision`
/// and is announced on the change feed.
#[derive(Clone)]
pub struct TripStore {
    db: DbPool,
    changes: mpsc::UnboundedSender<TripChange>,
}

impl TripStore {
    pub fn new(db: DbPool) -> (Self, ChangeFeed) {
        let (changes, feed) = mpsc::unbounded_channel();
        (Self { db, changes }, feed)
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    fn notify(&self, trip: &Trip, previous: Option<TripStatus>) {
        let change = TripChange {
            trip: trip.clone(),
            previous,
        };
        if self.changes.send(change).is_err() {
            debug!(trip_id = %trip.id, "change feed closed, notification dropped");
        }
    }

    pub async fn insert(&self, trip: &Trip) -> Result<(), TripError> {
        sqlx::query(
            r#"INSERT INTO trips (
                id, requester_id, driver_id,
                origin_lat, origin_lng, origin_address,
                destination_lat, destination_lng, destination_address,
                vehicle_category, distance, duration, price,
                description, passenger_travels, status, revision,
                created_at, updated_at
            ) VALUES (?, ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&trip.id)
        .bind(&trip.requester_id)
        .bind(trip.origin_lat)
        .bind(trip.origin_lng)
        .bind(&trip.origin_address)
        .bind(trip.destination_lat)
        .bind(trip.destination_lng)
        .bind(&trip.destination_address)
        .bind(&trip.vehicle_category)
        .bind(&trip.distance)
        .bind(&trip.duration)
        .bind(trip.price)
        .bind(&trip.description)
        .bind(trip.passenger_travels)
        .bind(TripStatus::Pending)
        .bind(trip.revision)
        .bind(trip.created_at)
        .bind(trip.updated_at)
        .execute(&self.db)
        .await?;

        self.notify(trip, None);
        Ok(())
    }

    pub async fn get(&self, trip_id: &str) -> Result<Option<Trip>, TripError> {
        let trip = sqlx::query_as::<_, Trip>("SELECT * FROM trips WHERE id = ?")
            .bind(trip_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(trip)
    }

    pub async fn list_pending(&self, category: &str) -> Result<Vec<Trip>, TripError> {
        let trips = sqlx::query_as::<_, Trip>(
            "SELECT * FROM trips WHERE status = 'pending' AND vehicle_category = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(category)
        .fetch_all(&self.db)
        .await?;
        Ok(trips)
    }

    /// Non-terminal trips bound to `driver_id`, earliest accepted first.
    pub async fn active_for_driver(&self, driver_id: &str) -> Result<Vec<Trip>, TripError> {
        let trips = sqlx::query_as::<_, Trip>(&format!(
            "SELECT * FROM trips WHERE driver_id = ? AND status IN {ACTIVE_STATUSES} ORDER BY accepted_at ASC, id ASC"
        ))
        .bind(driver_id)
        .fetch_all(&self.db)
        .await?;
        Ok(trips)
    }

    /// Compare-and-swap `(pending, no driver) -> (accepted, driver_id)`.
    ///
    /// Returns `None` when the precondition no longer holds.
    pub async fn claim(&self, trip_id: &str, driver_id: &str) -> Result<Option<Trip>, TripError> {
        let now = Utc::now();
        let claimed = sqlx::query_as::<_, Trip>(
            r#"UPDATE trips
               SET status = 'accepted',
                   driver_id = ?,
                   accepted_at = COALESCE(accepted_at, ?),
                   updated_at = ?,
                   revision = revision + 1
               WHERE id = ? AND status = 'pending' AND driver_id IS NULL
               RETURNING *"#,
        )
        .bind(driver_id)
        .bind(now)
        .bind(now)
        .bind(trip_id)
        .fetch_optional(&self.db)
        .await?;

        if let Some(trip) = &claimed {
            self.notify(trip, Some(TripStatus::Pending));
        }
        Ok(claimed)
    }

    /// Compare-and-swap on the current status.
    ///
    /// Stamps the checkpoint column of `to` only if it is still empty. A write
    /// into `completed` records the settlement obligation in the same
    /// transaction. Returns `None` when `from` is no longer current.
    pub async fn advance(
        &self,
        trip_id: &str,
        from: TripStatus,
        to: TripStatus,
        actor_id: &str,
    ) -> Result<Option<Trip>, TripError> {
        let Some(column) = to.checkpoint_column() else {
            return Err(TripError::IllegalTransition { from, to });
        };
        let now = Utc::now();
        let cancelled_by = (to == TripStatus::Cancelled).then_some(actor_id);
        let sql = format!(
            r#"UPDATE trips
               SET status = ?,
                   {column} = COALESCE({column}, ?),
                   cancelled_by = COALESCE(cancelled_by, ?),
                   updated_at = ?,
                   revision = revision + 1
               WHERE id = ? AND status = ?
               RETURNING *"#
        );

        let mut tx = self.db.begin().await?;
        let advanced = sqlx::query_as::<_, Trip>(&sql)
            .bind(to)
            .bind(now)
            .bind(cancelled_by)
            .bind(now)
            .bind(trip_id)
            .bind(from)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(trip) = &advanced {
            if to == TripStatus::Completed {
                if let Some(driver_id) = &trip.driver_id {
                    sqlx::query(
                        r#"INSERT OR IGNORE INTO settlements (trip_id, driver_id, price, state, attempts, requested_at)
                           VALUES (?, ?, ?, 'pending', 0, ?)"#,
                    )
                    .bind(&trip.id)
                    .bind(driver_id)
                    .bind(trip.price)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;

        if let Some(trip) = &advanced {
            self.notify(trip, Some(from));
        }
        Ok(advanced)
    }

    /// One-time rating of a completed trip by its requester.
    pub async fn rate(
        &self,
        trip_id: &str,
        requester_id: &str,
        rating: i64,
        comment: Option<&str>,
    ) -> Result<Option<Trip>, TripError> {
        let now = Utc::now();
        let rated = sqlx::query_as::<_, Trip>(
            r#"UPDATE trips
               SET rating = ?, rating_comment = ?, updated_at = ?, revision = revision + 1
               WHERE id = ? AND requester_id = ? AND status = 'completed' AND rating IS NULL
               RETURNING *"#,
        )
        .bind(rating)
        .bind(comment)
        .bind(now)
        .bind(trip_id)
        .bind(requester_id)
        .fetch_optional(&self.db)
        .await?;

        if let Some(trip) = &rated {
            self.notify(trip, Some(TripStatus::Completed));
        }
        Ok(rated)
    }
}
