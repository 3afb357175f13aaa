//! Feature extraction for the forecasting model
//!
//! Every feature is computed from closing prices only, ending at the last
//! element of the input slice.

/// Number of lagged log returns in each feature vector
pub const LAGS: usize = 6;
pub const RSI_PERIOD: usize = 14;
pub const SMA_PERIOD: usize = 24;

/// Prices needed to build one feature vector
pub const MIN_HISTORY: usize = SMA_PERIOD + 1;

/// Length of each feature vector: lags, RSI, price/SMA ratio
pub const FEATURE_COUNT: usize = LAGS + 2;

/// Log return between two consecutive prices
pub fn log_return(previous: f64, current: f64) -> f64 {
    (current / previous).ln()
}

/// Calculate Relative Strength Index (RSI)
///
/// Returns a value in [0, 100], or `None` with fewer than `period + 1` prices.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let recent = &prices[prices.len() - (period + 1)..];
    let (gains, losses) = recent
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold((0.0, 0.0), |(gains, losses), change| {
            if change > 0.0 {
                (gains + change, losses)
            } else {
                (gains, losses - change)
            }
        });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// Calculate Simple Moving Average (SMA) over the last `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Feature vector describing the market as of the last price
pub fn feature_vector(prices: &[f64]) -> Option<Vec<f64>> {
    if prices.len() < MIN_HISTORY {
        return None;
    }

    let mut features = Vec::with_capacity(FEATURE_COUNT);

    let last = prices.len() - 1;
    for lag in 0..LAGS {
        let i = last - lag;
        features.push(log_return(prices[i - 1], prices[i]));
    }

    // Centered and scaled to roughly [-0.5, 0.5]
    let rsi = calculate_rsi(prices, RSI_PERIOD)?;
    features.push(rsi / 100.0 - 0.5);

    let sma = calculate_sma(prices, SMA_PERIOD)?;
    features.push(prices[last] / sma - 1.0);

    features
        .iter()
        .all(|f| f.is_finite())
        .then_some(features)
}

/// (features, next-hour log return) pairs over a price series
///
/// Only prices at index `first_target` or later become targets; earlier
/// prices still feed the features.
pub fn training_samples(prices: &[f64], first_target: usize) -> Vec<(Vec<f64>, f64)> {
    if prices.len() <= MIN_HISTORY {
        return Vec::new();
    }

    (MIN_HISTORY.max(first_target)..prices.len())
        .filter_map(|next| {
            let features = feature_vector(&prices[..next])?;
            let target = log_return(prices[next - 1], prices[next]);
            target.is_finite().then_some((features, target))
        })
        .collect()
}
