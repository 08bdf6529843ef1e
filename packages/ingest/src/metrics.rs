//! Collection volume history and the low-volume anomaly check.

use chrono::{DateTime, Utc};
use seawatch_cache::{CacheStore, keys};
use seawatch_ingest_models::{MetricsHistory, MetricsSample};

/// Samples retained per source.
pub const MAX_SAMPLES: usize = 30;

/// Prior samples needed before the check applies.
pub const MIN_BASELINE_SAMPLES: usize = 3;

/// A collection below this fraction of the baseline mean is anomalous.
pub const ANOMALY_RATIO: f64 = 0.5;

/// Returns `true` if `collected` is below [`ANOMALY_RATIO`] of the mean of
/// `baseline`, given at least [`MIN_BASELINE_SAMPLES`] samples.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn is_anomalous(collected: usize, baseline: &[MetricsSample]) -> bool {
    if baseline.len() < MIN_BASELINE_SAMPLES {
        return false;
    }
    let total: usize = baseline.iter().map(|sample| sample.collected).sum();
    let mean = total as f64 / baseline.len() as f64;
    (collected as f64) < mean * ANOMALY_RATIO
}

/// Records a sample for `source` and reports whether it looks anomalous.
/// Write failures are logged only.
pub async fn record(
    store: &CacheStore,
    source: &str,
    collected: usize,
    new_count: usize,
    now: DateTime<Utc>,
) -> bool {
    let key = keys::metrics(source);
    let mut history: MetricsHistory = store.get_as(&key).await.unwrap_or_default();

    let anomaly = is_anomalous(collected, &history.samples);
    if anomaly {
        log::warn!(
            "{source}: collected {collected} incidents, under half the recent average of {} samples",
            history.samples.len()
        );
    }

    history.samples.insert(
        0,
        MetricsSample {
            timestamp: now,
            collected,
            new_count,
        },
    );
    history.samples.truncate(MAX_SAMPLES);

    if let Err(e) = store.store_as(&key, &history).await {
        log::warn!("{source}: failed to record collection metrics: {e}");
    }
    anomaly
}
