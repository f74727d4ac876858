use crate::{config, TrainingError};

/// Learning-rate schedule advanced once per optimizer step.
pub trait LRScheduler: Send {
    /// Advances one step and returns the rate for the next optimizer step.
    fn step(&mut self) -> f64;
    /// Rate for the upcoming optimizer step.
    fn learning_rate(&self) -> f64;
}

/// Linear warmup from zero to `base_lr`, then linear decay to zero at `total_steps`.
///
/// The rate at step `s` is `base_lr * s / max(1, warmup)` while `s < warmup` and
/// `base_lr * max(0, (total - s) / max(1, total - warmup))` afterwards, so the very
/// first optimizer step runs at zero when warmup is enabled.
#[derive(Debug, Clone)]
pub struct LinearWarmupDecay {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
}

impl LinearWarmupDecay {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        Ok(Self {
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
        })
    }

    pub fn from_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_steps: usize,
    ) -> Result<Self, TrainingError> {
        Self::new(base_lr, cfg.warmup_steps, total_steps)
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    fn multiplier(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        (remaining / span).max(0.0)
    }
}

impl LRScheduler for LinearWarmupDecay {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr * self.multiplier(self.step)
    }
}

/// Optimizer steps planned for a fold: `trunc(train_len / batch_size * epochs)`.
pub fn total_training_steps(train_len: usize, batch_size: usize, epochs: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    (train_len as f64 / batch_size as f64 * epochs as f64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn warms_up_then_decays_to_zero() {
        let mut scheduler = LinearWarmupDecay::new(1.0, 2, 6).unwrap();
        let mut rates = vec![scheduler.learning_rate()];
        for _ in 0..7 {
            rates.push(scheduler.step());
        }
        let expected = [0.0, 0.5, 1.0, 0.75, 0.5, 0.25, 0.0, 0.0];
        for (rate, want) in rates.iter().zip(expected) {
            assert!(close(*rate, want), "rates {:?}", rates);
        }
    }

    #[test]
    fn zero_warmup_starts_at_base_rate() {
        let mut scheduler = LinearWarmupDecay::new(2.0, 0, 4).unwrap();
        assert!(close(scheduler.learning_rate(), 2.0));
        assert!(close(scheduler.step(), 1.5));
        assert_eq!(scheduler.steps_taken(), 1);
    }

    #[test]
    fn warmup_longer_than_training_never_decays() {
        let mut scheduler = LinearWarmupDecay::new(1.0, 10, 4).unwrap();
        for _ in 0..4 {
            scheduler.step();
        }
        assert!(close(scheduler.learning_rate(), 0.4));
    }

    #[test]
    fn total_steps_truncates() {
        assert_eq!(total_training_steps(10, 3, 2), 6);
        assert_eq!(total_training_steps(10, 4, 1), 2);
        assert_eq!(total_training_steps(10, 0, 1), 0);
    }

    #[test]
    fn rejects_non_positive_base_rate() {
        assert!(LinearWarmupDecay::new(0.0, 1, 1).is_err());
    }
}
