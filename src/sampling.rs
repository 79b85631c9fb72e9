//! Buoyancy sampling and filtering
//!
//! One layer measurement turns a burst of raw sensor counts into a single
//! trustworthy volume reading:
//!
//! 1. Request `n` raw samples (`MEAS:BUOY:VALS n`) and convert them to volume
//!    units with the calibration factor.
//! 2. Run sequential outlier passes with tightening thresholds. Each pass
//!    recomputes the mean of its own input.
//! 3. Small requests (below `plain_mean_below`) use the plain mean of what
//!    survived. Larger requests are split into fixed-size groups; groups
//!    that are too noisy are discarded and the means of the rest averaged.
//! 4. When no group qualifies the whole measurement is repeated, up to
//!    `max_attempts` times with a linear backoff.
//!
//! The numeric steps are free functions so they can be checked in
//! isolation; [`BuoyancyFilter`] binds them to a configuration.

use crate::config::{CalibrationConfig, FilterConfig};
use crate::error::{ScanResult, ScannerError};
use crate::protocol::Scanner;
use crate::transport::strip_line_ending;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Parse a comma-terminated sample dump such as `"12,-3,7,"`.
///
/// The empty token after the final comma is dropped. Any other token that
/// is not an integer is a [`ScannerError::Parse`].
pub fn parse_samples(reply: &str) -> ScanResult<Vec<i64>> {
    let mut tokens: Vec<&str> = strip_line_ending(reply).split(',').collect();
    if tokens.last().is_some_and(|t| t.trim().is_empty()) {
        tokens.pop();
    }

    tokens
        .into_iter()
        .map(|token| {
            let token = token.trim();
            token
                .parse::<i64>()
                .map_err(|e| ScannerError::parse(token, e))
        })
        .collect()
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation, `None` for an empty slice.
pub fn population_std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Keep values whose absolute deviation from the slice mean does not exceed
/// `threshold`.
pub fn reject_outliers(values: &[f64], threshold: f64) -> Vec<f64> {
    let Some(m) = mean(values) else {
        return Vec::new();
    };
    values
        .iter()
        .copied()
        .filter(|v| (v - m).abs() <= threshold)
        .collect()
}

/// Apply [`reject_outliers`] once per threshold, each pass on the previous
/// pass's output.
pub fn filter_passes(values: &[f64], thresholds: &[f64]) -> Vec<f64> {
    thresholds
        .iter()
        .fold(values.to_vec(), |kept, &threshold| {
            reject_outliers(&kept, threshold)
        })
}

/// Mean of the per-group means of consecutive groups whose population
/// standard deviation is below `accepted_std_dev`.
///
/// A trailing partial group is ignored. `None` when no group qualifies.
pub fn grouped_deviation_average(
    values: &[f64],
    group_size: usize,
    accepted_std_dev: f64,
) -> Option<f64> {
    if group_size == 0 {
        return None;
    }
    let group_means: Vec<f64> = values
        .chunks_exact(group_size)
        .filter(|group| population_std_dev(group).is_some_and(|sd| sd < accepted_std_dev))
        .filter_map(mean)
        .collect();
    mean(&group_means)
}

/// Averages for one layer after filtering.
///
/// `requested` is the sample count that was asked for, not the count that
/// survived filtering.
pub fn layer_average(
    filtered: &[f64],
    requested: u32,
    plain_mean_below: u32,
    group_size: usize,
    accepted_std_dev: f64,
) -> Option<f64> {
    if requested < plain_mean_below && !filtered.is_empty() {
        return mean(filtered);
    }
    grouped_deviation_average(filtered, group_size, accepted_std_dev)
}

/// One accepted layer measurement, in volume units.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerResult {
    /// Every sample as received
    pub raw_samples: Vec<f64>,
    /// Samples that survived the outlier passes
    pub filtered_samples: Vec<f64>,
    /// Layer average
    pub average: f64,
}

/// Result of filtering one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    /// A defined average was found.
    Converged(LayerResult),
    /// No group passed the deviation check; the batch must be re-measured.
    Unconverged {
        /// Every sample as received
        raw_samples: Vec<f64>,
        /// Samples that survived the outlier passes
        filtered_samples: Vec<f64>,
    },
}

/// Outlier and deviation filter scaled to volume units
#[derive(Debug, Clone)]
pub struct BuoyancyFilter {
    factor: f64,
    pass_thresholds: Vec<f64>,
    group_size: usize,
    accepted_std_dev: f64,
    plain_mean_below: u32,
}

impl BuoyancyFilter {
    /// Scale the raw-count thresholds in `filter` by the calibration factor.
    pub fn new(filter: &FilterConfig, calibration: &CalibrationConfig) -> Self {
        let factor = calibration.sample_to_volume_factor();
        let scale = factor.abs();
        Self {
            factor,
            pass_thresholds: filter.pass_thresholds.iter().map(|t| t / scale).collect(),
            group_size: filter.group_size,
            accepted_std_dev: filter.accepted_std_dev / scale,
            plain_mean_below: filter.plain_mean_below,
        }
    }

    /// Convert raw counts to volume units.
    pub fn to_volume(&self, raw: &[i64]) -> Vec<f64> {
        raw.iter().map(|&count| count as f64 / self.factor).collect()
    }

    /// Outlier passes on samples already in volume units.
    pub fn reject(&self, samples: &[f64]) -> Vec<f64> {
        filter_passes(samples, &self.pass_thresholds)
    }

    /// Filter one raw batch obtained for a request of `requested` samples.
    pub fn evaluate(&self, raw: &[i64], requested: u32) -> FilterOutcome {
        let raw_samples = self.to_volume(raw);
        let filtered_samples = self.reject(&raw_samples);
        let average = layer_average(
            &filtered_samples,
            requested,
            self.plain_mean_below,
            self.group_size,
            self.accepted_std_dev,
        );

        match average {
            Some(average) => FilterOutcome::Converged(LayerResult {
                raw_samples,
                filtered_samples,
                average,
            }),
            None => FilterOutcome::Unconverged {
                raw_samples,
                filtered_samples,
            },
        }
    }
}

impl Scanner {
    /// Measure the current layer until the filter converges.
    ///
    /// Each attempt is a fresh `MEAS:BUOY:VALS <averages>` batch. Gives up
    /// with [`ScannerError::FilterConvergence`] after `max_attempts`.
    pub async fn measure_and_filter(&mut self, averages: u32) -> ScanResult<LayerResult> {
        if averages == 0 {
            return Err(ScannerError::InvalidArgument(
                "averages must be > 0".to_string(),
            ));
        }

        let filter = BuoyancyFilter::new(&self.filter, &self.calibration);
        let max_attempts = self.filter.max_attempts.max(1);
        let command = format!("MEAS:BUOY:VALS {}", averages);

        for attempt in 1..=max_attempts {
            let reply = self.query(&command).await?;
            let raw = parse_samples(&reply)?;

            match filter.evaluate(&raw, averages) {
                FilterOutcome::Converged(result) => {
                    debug!(
                        attempt,
                        received = result.raw_samples.len(),
                        kept = result.filtered_samples.len(),
                        average = result.average,
                        "layer measurement accepted"
                    );
                    return Ok(result);
                }
                FilterOutcome::Unconverged {
                    raw_samples,
                    filtered_samples,
                } => {
                    warn!(
                        attempt,
                        max_attempts,
                        received = raw_samples.len(),
                        kept = filtered_samples.len(),
                        "No sample group passed the deviation filter, repeating"
                    );
                    if attempt < max_attempts {
                        sleep(self.filter.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(ScannerError::FilterConvergence {
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScannerConfig;
    use crate::transport::MockTransport;
    use std::time::Duration;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    const PASSES: [f64; 3] = [400.0, 70.0, 40.0];

    fn dump(values: impl IntoIterator<Item = i64>) -> String {
        let mut reply: String = values.into_iter().map(|v| format!("{},", v)).collect();
        reply.push_str("\r\n");
        reply
    }

    #[test]
    fn test_parse_drops_trailing_empty_token() {
        assert_eq!(parse_samples("12,-3,7,\r\n").unwrap(), vec![12, -3, 7]);
        assert_eq!(parse_samples("5").unwrap(), vec![5]);
        assert!(parse_samples("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        match parse_samples("1,x2,3,") {
            Err(ScannerError::Parse { token, .. }) => assert_eq!(token, "x2"),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_isolated_outlier_removed() {
        let mut samples: Vec<f64> = [100.0, 102.0, 98.0, 101.0, 99.0]
            .iter()
            .copied()
            .cycle()
            .take(20)
            .collect();
        samples.insert(7, 5000.0);

        let first = reject_outliers(&samples, PASSES[0]);
        assert_eq!(first.len(), 20);
        assert!(!first.contains(&5000.0));

        let filtered = filter_passes(&samples, &PASSES);
        assert_eq!(filtered.len(), 20);
        assert!((mean(&filtered).unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_dominant_outlier_empties_small_batch() {
        // 5000 pulls the mean ~816 away from every other sample
        let samples = [100.0, 102.0, 98.0, 5000.0, 101.0, 99.0];
        assert!(reject_outliers(&samples, PASSES[0]).is_empty());
    }

    #[test]
    fn test_passes_are_idempotent_once_settled() {
        let batches: Vec<Vec<f64>> = vec![
            vec![1.0, 2.0, 3.0, 500.0, 2.0, 1.0, 3.0, 2.0, 2.0, 1.0],
            (0..200).map(|i| f64::from(i % 37) - 18.0).collect(),
            vec![-40.0, 40.0, 0.0, 0.0],
            vec![],
        ];
        for batch in batches {
            let filtered = filter_passes(&batch, &PASSES);
            for threshold in PASSES {
                assert_eq!(reject_outliers(&filtered, threshold), filtered);
            }
        }
    }

    #[test]
    fn test_grouped_average_skips_noisy_groups() {
        let mut values = vec![10.0; 50];
        values.extend((0..50).map(|i| if i % 2 == 0 { 0.0 } else { 100.0 }));
        values.extend(vec![20.0; 50]);
        values.extend(vec![1000.0; 10]); // partial group

        assert_eq!(grouped_deviation_average(&values, 50, 25.0), Some(15.0));
    }

    #[test]
    fn test_grouped_average_undefined_without_qualifying_group() {
        let noisy: Vec<f64> = (0..100).map(|i| if i % 2 == 0 { -50.0 } else { 50.0 }).collect();
        assert_eq!(grouped_deviation_average(&noisy, 50, 25.0), None);
        assert_eq!(grouped_deviation_average(&[1.0; 49], 50, 25.0), None);
    }

    #[test]
    fn test_layer_average_switches_on_requested_count() {
        let filtered = vec![3.0; 10];
        assert_eq!(layer_average(&filtered, 10, 50, 50, 25.0), Some(3.0));
        // too few survivors to fill a group
        assert_eq!(layer_average(&filtered, 50, 50, 50, 25.0), None);
        assert_eq!(layer_average(&[], 10, 50, 50, 25.0), None);
    }

    #[test]
    fn test_population_std_dev() {
        let sd = population_std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((sd - 2.0).abs() < 1e-12);
        assert_eq!(population_std_dev(&[]), None);
    }

    #[test]
    fn test_filter_scales_thresholds() {
        let filter = BuoyancyFilter::new(&FilterConfig::default(), &CalibrationConfig::default());
        let raw: Vec<i64> = (0..10).map(|i| -1272 + i).collect();
        match filter.evaluate(&raw, 10) {
            FilterOutcome::Converged(result) => {
                assert_eq!(result.filtered_samples.len(), 10);
                assert!((result.average - 1.0e-4).abs() < 1.0e-6);
            }
            other => panic!("expected convergence, got {:?}", other),
        }
    }

    fn unity_config() -> ScannerConfig {
        ScannerConfig {
            calibration: CalibrationConfig::unity(),
            ..ScannerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_measure_retries_until_converged() {
        let noisy = dump((0..100).map(|i| if i % 2 == 0 { -30 } else { 30 }));
        let steady = dump((0..100).map(|i| 40 + i % 3));
        let mock = MockTransport::new()
            .reply("MEAS:BUOY:VALS 100", noisy)
            .reply("MEAS:BUOY:VALS 100", steady);
        let history = mock.history();
        let mut scanner = Scanner::connect(Box::new(mock), &unity_config())
            .await
            .unwrap();

        let start = Instant::now();
        let result = scanner.measure_and_filter(100).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(history.commands().len(), 2);
        assert_eq!(result.raw_samples.len(), 100);
        assert!((result.average - 41.0).abs() < 0.05);
        assert!(logs_contain("No sample group passed the deviation filter"));
        scanner.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_gives_up_after_budget() {
        let mut config = unity_config();
        config.filter.max_attempts = 3;
        // no scripted replies: every batch is empty
        let mock = MockTransport::new();
        let history = mock.history();
        let mut scanner = Scanner::connect(Box::new(mock), &config).await.unwrap();

        let err = scanner.measure_and_filter(100).await.unwrap_err();
        assert!(matches!(err, ScannerError::FilterConvergence { attempts: 3 }));
        assert_eq!(history.commands().len(), 3);
        scanner.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_rejects_zero_averages() {
        let mut scanner = Scanner::connect(Box::new(MockTransport::new()), &unity_config())
            .await
            .unwrap();
        assert!(matches!(
            scanner.measure_and_filter(0).await,
            Err(ScannerError::InvalidArgument(_))
        ));
        scanner.close().await.unwrap();
    }
}
