use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use span_model::{SpanLogits, SpanModel};

use crate::{
    data::SpanBatch,
    distributed::ParallelModel,
    loss::{LossOutput, SpanLoss},
    optimizer::TrainerOptimizer,
    scheduler::LRScheduler,
    scoring::score_sample,
    TrainingError,
};

/// Batch loss and the per-sample match scores.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub loss: f64,
    pub scores: Vec<f64>,
}

/// One optimization step: forward, span loss, backward into a fresh gradient store,
/// gradient synchronization, AdamW update at the scheduler's current rate, then one
/// scheduler advance.
pub fn train_step<M: SpanModel>(
    model: &ParallelModel<M>,
    batch: &SpanBatch,
    optimizer: &mut TrainerOptimizer,
    scheduler: &mut dyn LRScheduler,
) -> Result<StepOutput, TrainingError> {
    let logits = forward(model, batch)?;
    let LossOutput { loss, value } = SpanLoss::new().compute(
        &logits.start,
        &logits.end,
        &batch.start_positions,
        &batch.end_positions,
    )?;

    let mut grads = loss.backward()?;
    model.synchronize_gradients(&mut grads)?;
    optimizer.set_learning_rate(scheduler.learning_rate());
    optimizer.step(&mut grads)?;
    model.sync_replicas()?;
    scheduler.step();

    let scores = score_batch(&logits, batch)?;
    Ok(StepOutput {
        loss: value as f64,
        scores,
    })
}

/// Forward pass and loss on detached logits; parameters and optimizer are untouched.
pub fn eval_step<M: SpanModel + ?Sized>(
    model: &M,
    batch: &SpanBatch,
) -> Result<StepOutput, TrainingError> {
    let logits = forward(model, batch)?;
    let logits = SpanLogits {
        start: logits.start.detach(),
        end: logits.end.detach(),
    };
    let LossOutput { value, .. } = SpanLoss::new().compute(
        &logits.start,
        &logits.end,
        &batch.start_positions,
        &batch.end_positions,
    )?;
    let scores = score_batch(&logits, batch)?;
    Ok(StepOutput {
        loss: value as f64,
        scores,
    })
}

/// Softmax over positions, arg-max span per sample, Jaccard against the target text.
pub fn score_batch(logits: &SpanLogits, batch: &SpanBatch) -> Result<Vec<f64>, TrainingError> {
    let start_probs = probabilities(&logits.start)?;
    let end_probs = probabilities(&logits.end)?;
    if start_probs.len() != batch.len() || end_probs.len() != batch.len() {
        return Err(TrainingError::runtime(format!(
            "model returned {} rows for a batch of {}",
            start_probs.len(),
            batch.len()
        )));
    }

    Ok((0..batch.len())
        .map(|row| {
            score_sample(
                &batch.texts[row],
                &batch.targets[row],
                &start_probs[row],
                &end_probs[row],
                &batch.offsets[row],
            )
        })
        .collect())
}

fn forward<M: SpanModel + ?Sized>(model: &M, batch: &SpanBatch) -> Result<SpanLogits, TrainingError> {
    Ok(model.forward(
        &batch.input_ids,
        &batch.attention_mask,
        &batch.token_type_ids,
    )?)
}

fn probabilities(logits: &Tensor) -> Result<Vec<Vec<f32>>, TrainingError> {
    let probs = ops::softmax(&logits.detach(), D::Minus1)?;
    Ok(probs.to_dtype(DType::F32)?.to_vec2::<f32>()?)
}
