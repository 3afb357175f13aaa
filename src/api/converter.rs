use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::MarketChartData;
use crate::models::{Observation, HOUR_SECS};

/// Converts irregular CoinGecko samples into hourly observations
///
/// Each series is bucketed to the start of its hour and the last sample in a
/// bucket wins. Hours without a price sample are left out so the collector
/// still sees them as gaps; nothing is interpolated.
pub struct HourlyConverter {
    interval_secs: i64,
}

impl HourlyConverter {
    pub fn new() -> Self {
        Self {
            interval_secs: HOUR_SECS,
        }
    }

    /// Convert market chart data to observations inside [start, end)
    pub fn convert(
        &self,
        symbol: &str,
        data: MarketChartData,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<Observation> {
        if data.prices.is_empty() {
            return Vec::new();
        }

        let prices = self.bucket_last(data.prices);
        let volumes = self.bucket_last(data.total_volumes);
        let market_caps = self.bucket_last(data.market_caps);

        let start_secs = start.timestamp();
        let end_secs = end.timestamp();

        prices
            .into_iter()
            .filter(|(bucket, _)| *bucket >= start_secs && *bucket < end_secs)
            .filter_map(|(bucket, price)| {
                let timestamp = DateTime::from_timestamp(bucket, 0)?;
                Some(Observation {
                    symbol: symbol.to_string(),
                    timestamp,
                    price,
                    volume: volumes.get(&bucket).copied().unwrap_or(0.0),
                    market_cap: market_caps.get(&bucket).copied().unwrap_or(0.0),
                })
            })
            .collect()
    }

    /// Bucket [timestamp_ms, value] points, keeping the latest sample per bucket
    fn bucket_last(&self, mut points: Vec<[f64; 2]>) -> BTreeMap<i64, f64> {
        points.retain(|p| p[0].is_finite() && p[1].is_finite());
        points.sort_by(|a, b| a[0].total_cmp(&b[0]));

        let mut buckets = BTreeMap::new();
        for point in points {
            let timestamp_secs = point[0] as i64 / 1000;
            let bucket = timestamp_secs - timestamp_secs.rem_euclid(self.interval_secs);
            // Sorted input, so a later insert is a later sample
            buckets.insert(bucket, point[1]);
        }
        buckets
    }
}

impl Default for HourlyConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ms(ts: DateTime<Utc>) -> f64 {
        ts.timestamp_millis() as f64
    }

    fn jan1(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_buckets_to_hour_and_keeps_last_sample() {
        let data = MarketChartData {
            prices: vec![
                [ms(jan1(0, 5)), 100.0],
                [ms(jan1(0, 55)), 101.0],
                [ms(jan1(1, 2)), 102.0],
            ],
            market_caps: vec![[ms(jan1(0, 55)), 1e9], [ms(jan1(1, 2)), 1.1e9]],
            total_volumes: vec![[ms(jan1(0, 55)), 5e6]],
        };

        let observations = HourlyConverter::new().convert("BTC", data, jan1(0, 0), jan1(2, 0));

        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].timestamp, jan1(0, 0));
        assert_eq!(observations[0].price, 101.0);
        assert_eq!(observations[0].volume, 5e6);
        assert_eq!(observations[0].market_cap, 1e9);
        assert_eq!(observations[1].timestamp, jan1(1, 0));
        assert_eq!(observations[1].price, 102.0);
        // No volume sample in that hour
        assert_eq!(observations[1].volume, 0.0);
    }

    #[test]
    fn test_drops_samples_outside_window() {
        let data = MarketChartData {
            prices: vec![
                [ms(jan1(0, 30)), 100.0],
                [ms(jan1(3, 30)), 103.0],
                [ms(jan1(5, 30)), 105.0],
            ],
            market_caps: Vec::new(),
            total_volumes: Vec::new(),
        };

        let observations = HourlyConverter::new().convert("ETH", data, jan1(1, 0), jan1(5, 0));

        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].timestamp, jan1(3, 0));
    }

    #[test]
    fn test_does_not_fill_gaps() {
        let data = MarketChartData {
            prices: vec![[ms(jan1(0, 0)), 100.0], [ms(jan1(4, 0)), 104.0]],
            market_caps: Vec::new(),
            total_volumes: Vec::new(),
        };

        let observations = HourlyConverter::new().convert("SOL", data, jan1(0, 0), jan1(5, 0));
        assert_eq!(observations.len(), 2);
    }

    #[test]
    fn test_empty_prices() {
        let data = MarketChartData {
            prices: Vec::new(),
            market_caps: Vec::new(),
            total_volumes: Vec::new(),
        };
        assert!(HourlyConverter::new()
            .convert("BTC", data, jan1(0, 0), jan1(1, 0))
            .is_empty());
    }
}
