use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

/// Throughput report for a finished phase (`train`, `eval`, ...).
///
/// Call right after the measured work completes. `start_after_warmup` marks
/// the end of warmup; throughput then only counts the time spent after it,
/// while `{split}_runtime` still reports the whole phase.
pub fn speed_metrics(
    split: &str,
    start: Instant,
    num_samples: Option<usize>,
    num_steps: Option<usize>,
    start_after_warmup: Option<Instant>,
) -> BTreeMap<String, f64> {
    let runtime = start.elapsed();
    let warmup = start_after_warmup.map(|after| after.saturating_duration_since(start));
    speed_metrics_from_elapsed(split, runtime, num_samples, num_steps, warmup)
}

/// Same as [`speed_metrics`] from already measured durations.
pub fn speed_metrics_from_elapsed(
    split: &str,
    runtime: Duration,
    num_samples: Option<usize>,
    num_steps: Option<usize>,
    warmup: Option<Duration>,
) -> BTreeMap<String, f64> {
    let mut result = BTreeMap::new();
    result.insert(
        format!("{split}_runtime"),
        round_to(runtime.as_secs_f64(), 4),
    );

    let measured = runtime
        .saturating_sub(warmup.unwrap_or_default())
        .as_secs_f64();
    if measured <= 0.0 {
        log::debug!("{split}: no time left after warmup, skipping throughput");
        return result;
    }

    if let Some(samples) = num_samples {
        result.insert(
            format!("{split}_samples_per_second"),
            round_to(samples as f64 / measured, 3),
        );
    }
    if let Some(steps) = num_steps {
        result.insert(
            format!("{split}_steps_per_second"),
            round_to(steps as f64 / measured, 3),
        );
    }
    result
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}
