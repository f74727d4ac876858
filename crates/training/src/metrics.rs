/// Weighted running mean: each update contributes `value * weight` to the sum and
/// `weight` to the count.
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    last: f64,
    sum: f64,
    count: usize,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, weight: usize) -> f64 {
        self.last = value;
        self.sum += value * weight as f64;
        self.count += weight;
        self.average()
    }

    /// Zero until the first non-empty update.
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Final running averages of one pass over a loader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub loss: f64,
    pub score: f64,
    pub samples: usize,
    pub batches: usize,
}

/// Loss and match-score accumulators for one epoch.
#[derive(Debug, Default)]
pub struct EpochMetrics {
    loss: RunningAverage,
    score: RunningAverage,
    batches: usize,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one batch: its mean loss and the per-sample match scores.
    pub fn record_batch(&mut self, loss: f64, scores: &[f64]) {
        let batch_size = scores.len();
        if batch_size == 0 {
            return;
        }
        let mean_score = scores.iter().sum::<f64>() / batch_size as f64;
        self.loss.update(loss, batch_size);
        self.score.update(mean_score, batch_size);
        self.batches += 1;
    }

    pub fn loss(&self) -> f64 {
        self.loss.average()
    }

    pub fn score(&self) -> f64 {
        self.score.average()
    }

    pub fn summary(&self) -> EpochSummary {
        EpochSummary {
            loss: self.loss.average(),
            score: self.score.average(),
            samples: self.score.count(),
            batches: self.batches,
        }
    }
}
