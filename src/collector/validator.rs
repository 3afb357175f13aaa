use chrono::{DateTime, Utc};

use crate::models::Observation;

/// Validates fetched observations before they are persisted
pub struct ObservationValidator;

impl ObservationValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate an observation for correctness
    pub fn validate(&self, observation: &Observation, now: DateTime<Utc>) -> Result<(), String> {
        if !observation.price.is_finite() || observation.price <= 0.0 {
            return Err(format!("Invalid price: {}", observation.price));
        }
        // Volume and market cap can be 0.0 when upstream has no sample for the hour
        if !observation.volume.is_finite() || observation.volume < 0.0 {
            return Err(format!("Invalid volume: {}", observation.volume));
        }
        if !observation.market_cap.is_finite() || observation.market_cap < 0.0 {
            return Err(format!("Invalid market cap: {}", observation.market_cap));
        }
        if observation.timestamp > now {
            return Err(format!(
                "Observation timestamp is in the future: {} (now: {})",
                observation.timestamp, now
            ));
        }
        Ok(())
    }

    /// Keep valid observations, returning them with the number rejected
    pub fn filter_valid(
        &self,
        observations: Vec<Observation>,
        now: DateTime<Utc>,
    ) -> (Vec<Observation>, usize) {
        let mut rejected = 0;
        let valid = observations
            .into_iter()
            .filter(|observation| match self.validate(observation, now) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        symbol = %observation.symbol,
                        "Validation failed for observation at {}: {}",
                        observation.timestamp,
                        e
                    );
                    rejected += 1;
                    false
                }
            })
            .collect();

        (valid, rejected)
    }
}

impl Default for ObservationValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_valid_observation() -> Observation {
        Observation {
            symbol: "BTC".to_string(),
            timestamp: Utc::now() - Duration::hours(1),
            price: 42000.0,
            volume: 1_000_000.0,
            market_cap: 8e11,
        }
    }

    #[test]
    fn test_validate_valid_observation() {
        let validator = ObservationValidator::new();
        assert!(validator.validate(&make_valid_observation(), Utc::now()).is_ok());
    }

    #[test]
    fn test_validate_non_positive_price() {
        let validator = ObservationValidator::new();
        let mut observation = make_valid_observation();
        observation.price = 0.0;

        let result = validator.validate(&observation, Utc::now());
        assert!(result.unwrap_err().contains("Invalid price"));
    }

    #[test]
    fn test_validate_nan_price() {
        let validator = ObservationValidator::new();
        let mut observation = make_valid_observation();
        observation.price = f64::NAN;

        assert!(validator.validate(&observation, Utc::now()).is_err());
    }

    #[test]
    fn test_validate_zero_volume_allowed() {
        let validator = ObservationValidator::new();
        let mut observation = make_valid_observation();
        observation.volume = 0.0;
        observation.market_cap = 0.0;

        assert!(validator.validate(&observation, Utc::now()).is_ok());
    }

    #[test]
    fn test_validate_negative_volume() {
        let validator = ObservationValidator::new();
        let mut observation = make_valid_observation();
        observation.volume = -1.0;

        let result = validator.validate(&observation, Utc::now());
        assert!(result.unwrap_err().contains("Invalid volume"));
    }

    #[test]
    fn test_validate_future_timestamp() {
        let validator = ObservationValidator::new();
        let mut observation = make_valid_observation();
        observation.timestamp = Utc::now() + Duration::hours(10);

        let result = validator.validate(&observation, Utc::now());
        assert!(result.unwrap_err().contains("future"));
    }

    #[test]
    fn test_filter_valid_counts_rejections() {
        let validator = ObservationValidator::new();
        let mut bad = make_valid_observation();
        bad.price = -5.0;

        let (valid, rejected) =
            validator.filter_valid(vec![make_valid_observation(), bad], Utc::now());

        assert_eq!(valid.len(), 1);
        assert_eq!(rejected, 1);
    }
}
