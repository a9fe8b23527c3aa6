// src/prediction/engine.rs
//
// The prediction pipeline: flatten the history into per-second color rows,
// cluster similar rows, pick the cluster that matches the currently running
// cycle, and collapse it into one color vector with confidences.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::history::{HistoryError, HistoryStore, MAX_CYCLE_SECS};
use crate::observation::{Observation, StreamKind};
use crate::registry::CycleRegistry;

use super::Prediction;

/// How far apart two cycles may be to land in the same cluster. With a very
/// high value, two distinct programs would be mixed together; with a very
/// low one, ordinary jitter would split a program into many clusters. Some
/// signal groups occasionally stretch a green by several seconds, which is
/// where this value comes from.
pub const MAX_CLUSTER_DISTANCE: usize = 8;

#[derive(Debug, Error)]
pub enum PredictionError {
    #[error(transparent)]
    NoHistory(#[from] HistoryError),
    #[error("history is empty")]
    EmptyHistory,
    #[error("history produced no usable prediction")]
    NotEnoughData,
}

/// The number of differing seconds between two rows. Positions beyond the
/// shorter row count as differences.
pub fn distance(a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let overlap = a.len().min(b.len());
    let mismatches = (0..overlap).filter(|&i| a[i] != b[i]).count();
    mismatches + a.len().abs_diff(b.len())
}

/// Greedy clustering of flattened cycles: each row joins the first cluster
/// whose representative (first) row is close enough, or starts a new one.
/// Clusters are returned ordered by size, descending.
pub fn cluster(rows: Vec<Vec<u8>>) -> Vec<Vec<Vec<u8>>> {
    let mut clusters: Vec<Vec<Vec<u8>>> = Vec::new();
    for row in rows {
        match clusters
            .iter_mut()
            .find(|cluster| distance(&cluster[0], &row) < MAX_CLUSTER_DISTANCE)
        {
            Some(cluster) => cluster.push(row),
            None => clusters.push(vec![row]),
        }
    }
    clusters.sort_by(|a, b| b.len().cmp(&a.len()));
    clusters
}

/// The cluster that best matches the currently running cycle. Without a
/// reference row, the most common cluster wins; ties go to the earlier
/// cluster.
pub fn best_cluster<'a>(clusters: &'a [Vec<Vec<u8>>], current: &[u8]) -> &'a [Vec<u8>] {
    if clusters.is_empty() {
        return &[];
    }
    if current.is_empty() {
        return &clusters[0];
    }
    let mut best: &'a [Vec<u8>] = &[];
    let mut best_distance = usize::MAX;
    for candidate in clusters {
        if candidate.is_empty() {
            continue;
        }
        let candidate_distance = distance(&candidate[0], current);
        if candidate_distance < best_distance {
            best_distance = candidate_distance;
            best = candidate;
        }
    }
    best
}

/// Collapse a cluster into the most common color per second, together with
/// the share of the vote that color won, in percent. Rows are weighted by
/// recency (the last row counts double the first) so a recent change in
/// behavior wins ties against the old pattern.
pub fn collapse(cluster: &[Vec<u8>]) -> (Vec<u8>, Vec<u8>) {
    let rows = cluster.len();
    if rows == 0 {
        return (Vec::new(), Vec::new());
    }
    // The shortest row bounds how far the cluster can be read.
    let length = cluster.iter().map(|row| row.len()).min().unwrap_or(0);

    let mut values = Vec::with_capacity(length);
    let mut quality = Vec::with_capacity(length);
    for second in 0..length {
        let mut counts: Vec<(u8, f64)> = Vec::new();
        let mut total = 0.0;
        for (row_index, row) in cluster.iter().enumerate() {
            let weight = if rows > 1 {
                1.0 + row_index as f64 / (rows - 1) as f64
            } else {
                1.0
            };
            let value = row[second];
            match counts.iter_mut().find(|(v, _)| *v == value) {
                Some((_, count)) => *count += weight,
                None => counts.push((value, weight)),
            }
            total += weight;
        }
        let mut winner = counts[0];
        for &candidate in &counts[1..] {
            if candidate.1 > winner.1 {
                winner = candidate;
            }
        }
        values.push(winner.0);
        quality.push((100.0 * winner.1 / total).round() as u8);
    }
    (values, quality)
}

/// Flatten observations into one color byte per second over `[lower, upper]`.
/// The window is clamped to at most [`MAX_CYCLE_SECS`]. Each observation's
/// value holds until the next observation; the first value is extended back
/// to `lower` and the last value forward to `upper`.
pub fn flatten_window(
    observations: &[Observation],
    lower: DateTime<Utc>,
    upper: DateTime<Utc>,
) -> Vec<u8> {
    if observations.is_empty() || lower > upper {
        return Vec::new();
    }
    let mut upper = upper;
    if upper - lower > Duration::seconds(MAX_CYCLE_SECS) {
        upper = lower + Duration::seconds(MAX_CYCLE_SECS);
    }
    let lo = lower.timestamp();
    let hi = upper.timestamp();

    let mut flattened = Vec::new();
    for i in 1..observations.len() {
        let prev = &observations[i - 1];
        let curr = &observations[i];
        let from = lo.max(prev.phenomenon_time.timestamp());
        let to = hi.min(curr.phenomenon_time.timestamp());
        if from > to {
            continue;
        }
        // Extend the first known value back to the window start. Not
        // supposed to happen in practice, since the first observation of a
        // rotated cycle precedes the window.
        if i == 1 && from > lo {
            flattened.extend(std::iter::repeat(prev.result).take((from - lo) as usize));
        }
        flattened.extend(std::iter::repeat(prev.result).take((to - from) as usize));
        // Extend the last known value forward to the window end.
        if i == observations.len() - 1 && to < hi {
            flattened.extend(std::iter::repeat(curr.result).take((hi - to) as usize));
        }
    }
    flattened
}

/// Calculate the best possible prediction for a thing:
/// load the best fitting history, correlate its clusters with the currently
/// running cycle, and collapse the matching cluster into the `now` vector
/// and the most common cluster into the `then` vector.
pub async fn predict(
    store: &HistoryStore,
    registry: &CycleRegistry,
    thing: &str,
) -> Result<Prediction, PredictionError> {
    let (history, program_id) = store.load_best(thing).await?;
    let Some(last_cycle) = history.cycles.last() else {
        return Err(PredictionError::EmptyHistory);
    };

    // By default the prediction extends the last recorded cycle. The history
    // is filtered for erroneous cycles though, so the live primary signal
    // cycle may end more recently; prefer its boundary when it does.
    let mut reference_time = last_cycle.end_time;
    let mut running_cycle: Vec<Observation> = Vec::new();
    if let Some(cycle) = registry.get(StreamKind::PrimarySignal, thing) {
        let snapshot = cycle.snapshot();
        running_cycle = snapshot.pending.clone();
        if running_cycle.is_empty() {
            // A signal that sits in the same state for a whole cycle sends
            // nothing new; its last known observation still anchors `now`.
            if let Some(most_recent) = snapshot.most_recent() {
                running_cycle.push(most_recent);
            }
        }
        if let Some(end_time) = snapshot.end_time {
            if end_time > reference_time {
                reference_time = end_time;
            }
        }
    }

    let now = Utc::now();
    let running_row = if !running_cycle.is_empty()
        && now - reference_time <= Duration::seconds(MAX_CYCLE_SECS)
    {
        flatten_window(&running_cycle, reference_time, now)
    } else {
        Vec::new()
    };

    let clusters = cluster(history.flatten());
    let (now_values, now_quality) = collapse(best_cluster(&clusters, &running_row));
    let (then_values, then_quality) = collapse(best_cluster(&clusters, &[]));
    if now_values.is_empty() || then_values.is_empty() {
        return Err(PredictionError::NotEnoughData);
    }

    Ok(Prediction {
        thing_name: thing.to_string(),
        now: now_values,
        now_quality,
        then: then_values,
        then_quality,
        reference_time,
        program_id,
    })
}
