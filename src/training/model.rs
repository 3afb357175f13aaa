use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::features::{feature_vector, training_samples, FEATURE_COUNT, MIN_HISTORY};
use crate::config::TrainingSettings;
use crate::models::{Forecast, Observation};
use crate::{Error, Result};

/// Fewest samples a fit will accept
pub const MIN_SAMPLES: usize = 8;

/// Trainable forecasting model
///
/// Weights are opaque bytes so any model can sit behind the model store.
/// Calls are synchronous and CPU-bound; callers run them on the blocking pool.
pub trait Forecaster: Send + Sync {
    fn name(&self) -> &str;

    /// Train for `epochs`, starting from `prior` weights when given
    ///
    /// The first `history` observations only supply feature context and are
    /// never used as targets.
    fn fit(
        &self,
        prior: Option<&[u8]>,
        observations: &[Observation],
        history: usize,
        epochs: usize,
    ) -> Result<Vec<u8>>;

    /// Forecast the next hour from the most recent observations
    fn predict(&self, weights: &[u8], recent: &[Observation]) -> Result<Forecast>;

    /// Observations `predict` needs
    fn context_len(&self) -> usize;
}

/// Serialized form of [`LinearForecaster`] weights
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinearWeights {
    pub weights: Vec<f64>,
    pub bias: f64,
    /// Standard deviation of training residuals, drives confidence
    pub residual_std: f64,
    pub samples_seen: u64,
}

impl LinearWeights {
    fn decode(bytes: &[u8]) -> Result<Self> {
        let weights: LinearWeights = serde_json::from_slice(bytes)
            .map_err(|e| Error::Training(format!("Corrupt model weights: {}", e)))?;

        if weights.weights.len() != FEATURE_COUNT {
            return Err(Error::Training(format!(
                "Model expects {} features, weights have {}",
                FEATURE_COUNT,
                weights.weights.len()
            )));
        }
        Ok(weights)
    }

    fn output(&self, features: &[f64]) -> f64 {
        self.bias
            + self
                .weights
                .iter()
                .zip(features)
                .map(|(w, x)| w * x)
                .sum::<f64>()
    }
}

/// Linear model over lagged log returns, RSI and price/SMA ratio
///
/// Predicts the next hour's log return; trained by full-batch gradient
/// descent on squared error with L2 regularization.
pub struct LinearForecaster {
    learning_rate: f64,
    l2_penalty: f64,
    seed: u64,
}

impl LinearForecaster {
    pub fn new(learning_rate: f64, l2_penalty: f64, seed: u64) -> Self {
        Self {
            learning_rate,
            l2_penalty,
            seed,
        }
    }

    pub fn from_settings(settings: &TrainingSettings) -> Self {
        Self::new(settings.learning_rate, settings.l2_penalty, settings.seed)
    }

    fn initial_weights(&self) -> LinearWeights {
        let mut rng = StdRng::seed_from_u64(self.seed);
        LinearWeights {
            weights: (0..FEATURE_COUNT)
                .map(|_| rng.gen_range(-0.01..0.01))
                .collect(),
            bias: 0.0,
            residual_std: 0.0,
            samples_seen: 0,
        }
    }
}

impl Forecaster for LinearForecaster {
    fn name(&self) -> &str {
        "linear"
    }

    fn fit(
        &self,
        prior: Option<&[u8]>,
        observations: &[Observation],
        history: usize,
        epochs: usize,
    ) -> Result<Vec<u8>> {
        let prices: Vec<f64> = observations.iter().map(|o| o.price).collect();
        let samples = training_samples(&prices, history);

        // Extending a trained model needs only one new sample
        let required = if prior.is_some() { 1 } else { MIN_SAMPLES };
        if samples.len() < required {
            return Err(Error::Training(format!(
                "Insufficient data: {} samples from {} observations (need {})",
                samples.len(),
                observations.len(),
                required
            )));
        }

        let mut model = match prior {
            Some(bytes) => LinearWeights::decode(bytes)?,
            None => self.initial_weights(),
        };

        let n = samples.len() as f64;

        for epoch in 0..epochs {
            let mut grad_w = vec![0.0; FEATURE_COUNT];
            let mut grad_b = 0.0;
            let mut loss = 0.0;

            for (features, target) in &samples {
                let error = model.output(features) - target;
                loss += error * error;
                grad_b += error;
                for (g, x) in grad_w.iter_mut().zip(features) {
                    *g += error * x;
                }
            }

            loss /= n;
            if !loss.is_finite() {
                return Err(Error::Training(format!(
                    "Training diverged at epoch {} (loss {})",
                    epoch, loss
                )));
            }

            for (w, g) in model.weights.iter_mut().zip(&grad_w) {
                *w -= self.learning_rate * (2.0 * g / n + 2.0 * self.l2_penalty * *w);
            }
            model.bias -= self.learning_rate * 2.0 * grad_b / n;
        }

        let residual_var = samples
            .iter()
            .map(|(features, target)| (model.output(features) - target).powi(2))
            .sum::<f64>()
            / n;

        model.residual_std = residual_var.sqrt();
        if !model.residual_std.is_finite() || model.weights.iter().any(|w| !w.is_finite()) {
            return Err(Error::Training("Training diverged: non-finite weights".to_string()));
        }
        model.samples_seen += samples.len() as u64;

        Ok(serde_json::to_vec(&model)?)
    }

    fn predict(&self, weights: &[u8], recent: &[Observation]) -> Result<Forecast> {
        let model = LinearWeights::decode(weights)?;

        let prices: Vec<f64> = recent.iter().map(|o| o.price).collect();
        let features = feature_vector(&prices).ok_or_else(|| {
            Error::Training(format!(
                "Need {} recent observations to predict, have {}",
                MIN_HISTORY,
                prices.len()
            ))
        })?;

        let current_price = prices[prices.len() - 1];
        let predicted_value = current_price * model.output(&features).exp();
        if !predicted_value.is_finite() {
            return Err(Error::Training(format!(
                "Non-finite prediction from price {}",
                current_price
            )));
        }

        // Residual std is in log-return units: 1% hourly error gives 0.5
        let confidence = (1.0 / (1.0 + model.residual_std * 100.0)).clamp(0.0, 1.0);

        Ok(Forecast {
            current_price,
            predicted_value,
            confidence,
        })
    }

    fn context_len(&self) -> usize {
        MIN_HISTORY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn series(n: usize, price: impl Fn(usize) -> f64) -> Vec<Observation> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| Observation {
                symbol: "BTC".to_string(),
                timestamp: start + Duration::hours(i as i64),
                price: price(i),
                volume: 1.0,
                market_cap: 1.0,
            })
            .collect()
    }

    fn wave(i: usize) -> f64 {
        100.0 + 5.0 * (i as f64 / 6.0).sin() + i as f64 * 0.05
    }

    fn forecaster() -> LinearForecaster {
        LinearForecaster::new(0.05, 1e-4, 42)
    }

    #[test]
    fn test_fit_is_deterministic() {
        let data = series(200, wave);
        let a = forecaster().fit(None, &data, 0, 20).unwrap();
        let b = forecaster().fit(None, &data, 0, 20).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fit_insufficient_data() {
        let data = series(MIN_HISTORY + 3, wave);
        let err = forecaster().fit(None, &data, 0, 5).unwrap_err();
        assert!(matches!(err, Error::Training(_)));
    }

    #[test]
    fn test_fit_from_prior_accumulates_samples() {
        let data = series(200, wave);
        let first = forecaster().fit(None, &data, 0, 10).unwrap();
        let second = forecaster().fit(Some(&first), &data, 0, 10).unwrap();

        let first: LinearWeights = serde_json::from_slice(&first).unwrap();
        let second: LinearWeights = serde_json::from_slice(&second).unwrap();
        assert_eq!(second.samples_seen, first.samples_seen * 2);
    }

    #[test]
    fn test_fit_from_prior_trains_on_new_targets_only() {
        let data = series(200, wave);
        let model = forecaster();
        let first = model.fit(None, &data[..150], 0, 10).unwrap();
        let first_seen = serde_json::from_slice::<LinearWeights>(&first)
            .unwrap()
            .samples_seen;

        // 48 hours of history ahead of 2 new hours
        let extended = model.fit(Some(&first), &data[100..150 + 2], 50, 3).unwrap();
        let extended: LinearWeights = serde_json::from_slice(&extended).unwrap();
        assert_eq!(extended.samples_seen - first_seen, 2);

        // Nothing new to learn from
        assert!(model.fit(Some(&first), &data[100..150], 50, 3).is_err());
    }

    #[test]
    fn test_fit_rejects_corrupt_prior() {
        let data = series(200, wave);
        let err = forecaster().fit(Some(b"not json"), &data, 0, 5).unwrap_err();
        assert!(err.to_string().contains("Corrupt"));
    }

    #[test]
    fn test_fit_detects_divergence() {
        let data = series(200, wave);
        let unstable = LinearForecaster::new(1e6, 0.0, 42);
        let err = unstable.fit(None, &data, 0, 500).unwrap_err();
        assert!(err.to_string().contains("diverged"));
    }

    #[test]
    fn test_predict() {
        let data = series(200, wave);
        let model = forecaster();
        let weights = model.fit(None, &data, 0, 50).unwrap();

        let recent = &data[data.len() - model.context_len()..];
        let forecast = model.predict(&weights, recent).unwrap();

        assert_eq!(forecast.current_price, recent[recent.len() - 1].price);
        assert!(forecast.predicted_value.is_finite());
        assert!(forecast.predicted_value > 0.0);
        assert!(forecast.confidence > 0.0 && forecast.confidence <= 1.0);
    }

    #[test]
    fn test_predict_needs_history() {
        let data = series(200, wave);
        let model = forecaster();
        let weights = model.fit(None, &data, 0, 5).unwrap();

        assert!(model.predict(&weights, &data[..5]).is_err());
    }
}
