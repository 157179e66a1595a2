use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    error::TripError,
    models::trip::{Trip, TripStatus},
    services::{store::TripStore, verification::DriverDirectory},
};

/// Surfaces claimable trips and arbitrates claims between drivers.
#[derive(Clone)]
pub struct DispatchEngine {
    store: TripStore,
    drivers: Arc<dyn DriverDirectory>,
}

impl DispatchEngine {
    pub fn new(store: TripStore, drivers: Arc<dyn DriverDirectory>) -> Self {
        Self { store, drivers }
    }

    /// The vehicle category a driver may currently claim in, if eligible.
    pub async fn eligible_category(&self, driver_id: &str) -> Result<Option<String>, TripError> {
        let profile = self.drivers.profile(driver_id).await?;
        Ok(profile.and_then(|p| p.claimable_category().map(str::to_lowercase)))
    }

    pub async fn list_claimable(&self, driver_id: &str) -> Result<Vec<Trip>, TripError> {
        let Some(category) = self.eligible_category(driver_id).await? else {
            debug!(driver_id, "driver not eligible, nothing claimable");
            return Ok(Vec::new());
        };
        self.store.list_pending(&category).await
    }

    /// Binds `driver_id` to a pending trip.
    ///
    /// The pre-checks are advisory; the store's conditional write is the only
    /// arbiter between racing drivers.
    pub async fn claim(&self, trip_id: &str, driver_id: &str) -> Result<Trip, TripError> {
        let category = self
            .eligible_category(driver_id)
            .await?
            .ok_or(TripError::NotClaimable)?;

        let trip = self
            .store
            .get(trip_id)
            .await?
            .ok_or(TripError::NotClaimable)?;
        match trip.status {
            TripStatus::Pending => {}
            TripStatus::Accepted if trip.is_driver(driver_id) => {
                return Err(TripError::AlreadyApplied)
            }
            // Taken moments ago: the caller lost the race, the trip is real.
            TripStatus::Accepted => return Err(TripError::ClaimConflict),
            _ => return Err(TripError::NotClaimable),
        }
        if trip.vehicle_category != category {
            return Err(TripError::NotClaimable);
        }

        if !self.store.active_for_driver(driver_id).await?.is_empty() {
            debug!(driver_id, trip_id, "claim refused, driver busy");
            return Err(TripError::DriverBusy);
        }

        match self.store.claim(trip_id, driver_id).await? {
            Some(claimed) => {
                info!(trip_id, driver_id, "trip claimed");
                Ok(claimed)
            }
            None => {
                debug!(trip_id, driver_id, "claim lost the race");
                Err(TripError::ClaimConflict)
            }
        }
    }
}
