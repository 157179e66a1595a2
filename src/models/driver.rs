use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Verification collaborator's view of a driver, read on demand.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct DriverProfile {
    pub driver_id: String,
    pub active_category: Option<String>,
    pub available: bool,
    pub verified: bool,
}

impl DriverProfile {
    /// The category this driver may claim trips in, if any.
    pub fn claimable_category(&self) -> Option<&str> {
        if !self.verified || !self.available {
            return None;
        }
        self.active_category
            .as_deref()
            .map(str::trim)
            .filter(|category| !category.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(available: bool, verified: bool, category: Option<&str>) -> DriverProfile {
        DriverProfile {
            driver_id: "d1".into(),
            active_category: category.map(str::to_string),
            available,
            verified,
        }
    }

    #[test]
    fn only_verified_available_drivers_have_a_category() {
        assert_eq!(profile(true, true, Some("van")).claimable_category(), Some("van"));
        assert_eq!(profile(false, true, Some("van")).claimable_category(), None);
        assert_eq!(profile(true, false, Some("van")).claimable_category(), None);
        assert_eq!(profile(true, true, Some("  ")).claimable_category(), None);
        assert_eq!(profile(true, true, None).claimable_category(), None);
    }
}
