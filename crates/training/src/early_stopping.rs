use std::path::Path;

use crate::{checkpoint::ModelSnapshot, TrainingError};

/// Direction in which the tracked metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    #[default]
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopState {
    Watching,
    Stopped,
}

/// Outcome of one [`EarlyStopping::observe`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// New best; the snapshot was persisted.
    Improved,
    /// No improvement; `stale` consecutive evaluations without one.
    Stale { stale: usize },
    /// Patience exhausted, or the controller had already stopped.
    Stopped,
}

/// Patience-based early stopping that persists the best model seen so far.
///
/// Equal values never count as improvement, and neither do non-finite ones.
/// `min_delta` widens the margin a new value has to clear. Once stopped the
/// controller stays stopped.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    mode: StopMode,
    min_delta: f64,
    best: Option<f64>,
    counter: usize,
    state: StopState,
}

impl EarlyStopping {
    pub fn new(patience: usize, mode: StopMode) -> Self {
        Self {
            patience,
            mode,
            min_delta: 0.0,
            best: None,
            counter: 0,
            state: StopState::Watching,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta.abs();
        self
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn state(&self) -> StopState {
        self.state
    }

    pub fn should_stop(&self) -> bool {
        self.state == StopState::Stopped
    }

    /// Feeds one evaluation score. On improvement `snapshot` is persisted at `path`.
    pub fn observe(
        &mut self,
        score: f64,
        snapshot: &dyn ModelSnapshot,
        path: &Path,
    ) -> Result<Observation, TrainingError> {
        if self.should_stop() {
            return Ok(Observation::Stopped);
        }

        if self.improves(score) {
            snapshot.persist(path, score)?;
            self.best = Some(score);
            self.counter = 0;
            return Ok(Observation::Improved);
        }

        self.counter += 1;
        if self.counter >= self.patience {
            self.state = StopState::Stopped;
            return Ok(Observation::Stopped);
        }
        Ok(Observation::Stale {
            stale: self.counter,
        })
    }

    fn improves(&self, score: f64) -> bool {
        if !score.is_finite() {
            return false;
        }
        match (self.best, self.mode) {
            (None, _) => true,
            (Some(best), StopMode::Max) => score > best + self.min_delta,
            (Some(best), StopMode::Min) => score < best - self.min_delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, path::PathBuf};

    #[derive(Default)]
    struct Recorder {
        saved: RefCell<Vec<f64>>,
    }

    impl ModelSnapshot for Recorder {
        fn persist(&self, _path: &Path, score: f64) -> Result<(), TrainingError> {
            self.saved.borrow_mut().push(score);
            Ok(())
        }
    }

    fn feed(stopper: &mut EarlyStopping, recorder: &Recorder, scores: &[f64]) -> Vec<Observation> {
        let path = PathBuf::from("model_0.safetensors");
        scores
            .iter()
            .map(|score| stopper.observe(*score, recorder, &path).unwrap())
            .collect()
    }

    #[test]
    fn increasing_scores_checkpoint_every_time() {
        let mut stopper = EarlyStopping::new(1, StopMode::Max);
        let recorder = Recorder::default();
        let outcomes = feed(&mut stopper, &recorder, &[0.1, 0.2, 0.35, 0.9]);

        assert!(outcomes.iter().all(|o| *o == Observation::Improved));
        assert_eq!(*recorder.saved.borrow(), vec![0.1, 0.2, 0.35, 0.9]);
        assert_eq!(stopper.counter(), 0);
        assert!(!stopper.should_stop());
    }

    #[test]
    fn plateau_exhausts_patience() {
        let mut stopper = EarlyStopping::new(2, StopMode::Max);
        let recorder = Recorder::default();
        let outcomes = feed(&mut stopper, &recorder, &[0.5, 0.5, 0.5]);

        assert_eq!(
            outcomes,
            vec![
                Observation::Improved,
                Observation::Stale { stale: 1 },
                Observation::Stopped
            ]
        );
        assert!(stopper.should_stop());
        assert_eq!(*recorder.saved.borrow(), vec![0.5]);
        assert_eq!(stopper.best(), Some(0.5));
    }

    #[test]
    fn stopped_controller_ignores_later_improvements() {
        let mut stopper = EarlyStopping::new(1, StopMode::Max);
        let recorder = Recorder::default();
        feed(&mut stopper, &recorder, &[0.4, 0.3]);
        assert!(stopper.should_stop());

        let outcomes = feed(&mut stopper, &recorder, &[0.99]);
        assert_eq!(outcomes, vec![Observation::Stopped]);
        assert_eq!(*recorder.saved.borrow(), vec![0.4]);
        assert_eq!(stopper.state(), StopState::Stopped);
    }

    #[test]
    fn improvement_resets_counter() {
        let mut stopper = EarlyStopping::new(3, StopMode::Max);
        let recorder = Recorder::default();
        feed(&mut stopper, &recorder, &[0.5, 0.4, 0.45]);
        assert_eq!(stopper.counter(), 2);
        feed(&mut stopper, &recorder, &[0.6]);
        assert_eq!(stopper.counter(), 0);
        assert_eq!(*recorder.saved.borrow(), vec![0.5, 0.6]);
    }

    #[test]
    fn min_mode_and_delta() {
        let mut stopper = EarlyStopping::new(5, StopMode::Min).with_min_delta(0.05);
        let recorder = Recorder::default();
        feed(&mut stopper, &recorder, &[1.0, 0.97, 0.9]);
        assert_eq!(*recorder.saved.borrow(), vec![1.0, 0.9]);
    }

    #[test]
    fn non_finite_scores_are_never_improvements() {
        let mut stopper = EarlyStopping::new(3, StopMode::Max);
        let recorder = Recorder::default();
        feed(&mut stopper, &recorder, &[f64::NAN, 0.2, f64::INFINITY]);
        assert_eq!(*recorder.saved.borrow(), vec![0.2]);
        assert_eq!(stopper.counter(), 1);
    }

    #[test]
    fn failed_persist_propagates() {
        struct Failing;
        impl ModelSnapshot for Failing {
            fn persist(&self, _path: &Path, _score: f64) -> Result<(), TrainingError> {
                Err(TrainingError::runtime("disk full"))
            }
        }
        let mut stopper = EarlyStopping::new(2, StopMode::Max);
        assert!(stopper
            .observe(0.3, &Failing, Path::new("unused"))
            .is_err());
        assert_eq!(stopper.best(), None);
    }
}
