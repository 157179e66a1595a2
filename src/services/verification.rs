use async_trait::async_trait;

use crate::{db::DbPool, error::TripError, models::driver::DriverProfile};

/// Source of truth for driver eligibility, owned by the verification
/// workflow outside this crate.
#[async_trait]
pub trait DriverDirectory: Send + Sync {
    async fn profile(&self, driver_id: &str) -> Result<Option<DriverProfile>, TripError>;
}

/// Reads the `drivers` table the verification workflow maintains.
#[derive(Clone)]
pub struct SqliteDriverDirectory {
    db: DbPool,
}

impl SqliteDriverDirectory {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, profile: &DriverProfile) -> Result<(), TripError> {
        sqlx::query(
            r#"INSERT INTO drivers (driver_id, active_category, available, verified)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (driver_id) DO UPDATE SET
                   active_category = excluded.active_category,
                   available = excluded.available,
                   verified = excluded.verified"#,
        )
        .bind(&profile.driver_id)
        .bind(profile.active_category.as_deref().map(str::to_lowercase))
        .bind(profile.available)
        .bind(profile.verified)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DriverDirectory for SqliteDriverDirectory {
    async fn profile(&self, driver_id: &str) -> Result<Option<DriverProfile>, TripError> {
        let profile = sqlx::query_as::<_, DriverProfile>(
            "SELECT driver_id, active_category, available, verified FROM drivers WHERE driver_id = ?",
        )
        .bind(driver_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(profile)
    }
}
