use span_model::SpanModel;

use crate::{
    data::SpanDataLoader,
    distributed::ParallelModel,
    logging::{Logger, Phase},
    metrics::{EpochMetrics, EpochSummary},
    optimizer::TrainerOptimizer,
    scheduler::LRScheduler,
    step::{eval_step, train_step},
    TrainingError,
};

/// What an epoch does with each batch.
pub enum EpochMode<'a> {
    Train {
        optimizer: &'a mut TrainerOptimizer,
        scheduler: &'a mut dyn LRScheduler,
    },
    Eval,
}

impl EpochMode<'_> {
    pub fn phase(&self) -> Phase {
        match self {
            EpochMode::Train { .. } => Phase::Train,
            EpochMode::Eval => Phase::Valid,
        }
    }
}

/// Identifies an epoch in progress output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochLabel {
    pub fold: usize,
    pub epoch: usize,
}

/// Runs every batch of `loader` once, in loader order, and returns the running
/// averages of loss and match score at the end of the pass.
pub fn run_epoch<M: SpanModel>(
    model: &ParallelModel<M>,
    loader: &SpanDataLoader,
    mut mode: EpochMode<'_>,
    logger: &mut Logger,
    label: EpochLabel,
) -> Result<EpochSummary, TrainingError> {
    let phase = mode.phase();
    model.set_training(phase == Phase::Train);

    let bar = logger.progress_bar(loader.num_batches(), phase, label.fold, label.epoch);
    let mut metrics = EpochMetrics::new();

    for batch in loader.iter() {
        let batch = batch?;
        let output = match &mut mode {
            EpochMode::Train {
                optimizer,
                scheduler,
            } => {
                logger.log_learning_rate(scheduler.learning_rate());
                train_step(model, &batch, optimizer, &mut **scheduler)?
            }
            EpochMode::Eval => eval_step(model, &batch)?,
        };

        metrics.record_batch(output.loss, &output.scores);
        bar.set_message(format!(
            "loss={:.4} jaccard={:.4}",
            metrics.loss(),
            metrics.score()
        ));
        bar.inc(1);
    }
    bar.finish();

    let summary = metrics.summary();
    logger.log_epoch(label.fold, label.epoch, phase, &summary);
    Ok(summary)
}
