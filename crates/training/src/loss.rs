use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

/// Sum of the start-position and end-position cross entropies, each averaged over
/// the batch.
///
/// Every position takes part in the softmax, padding included.
#[derive(Debug, Clone, Default)]
pub struct SpanLoss;

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub value: f32,
}

impl SpanLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(
        &self,
        start_logits: &Tensor,
        end_logits: &Tensor,
        start_targets: &Tensor,
        end_targets: &Tensor,
    ) -> Result<LossOutput, TrainingError> {
        let start = cross_entropy(start_logits, start_targets)?;
        let end = cross_entropy(end_logits, end_targets)?;
        let loss = (start + end)?;
        let value = loss.to_vec0::<f32>()?;
        Ok(LossOutput { loss, value })
    }
}

/// Convenience wrapper returning the scalar loss tensor.
pub fn span_loss(
    start_logits: &Tensor,
    end_logits: &Tensor,
    start_targets: &Tensor,
    end_targets: &Tensor,
) -> Result<Tensor, TrainingError> {
    Ok(SpanLoss::new()
        .compute(start_logits, end_logits, start_targets, end_targets)?
        .loss)
}

fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
    let (batch, positions) = logits.dims2().map_err(|_| {
        TrainingError::runtime(format!(
            "span logits must be (batch, seq_len), got {:?}",
            logits.dims()
        ))
    })?;
    if batch == 0 || positions == 0 {
        return Err(TrainingError::runtime(
            "span loss requires a non-empty batch and sequence",
        ));
    }
    if targets.dims() != [batch] {
        return Err(TrainingError::runtime(format!(
            "span targets must be ({},), got {:?}",
            batch,
            targets.dims()
        )));
    }

    let targets = targets.to_device(logits.device())?;
    let targets = match targets.dtype() {
        DType::U32 => targets,
        DType::I64 | DType::U8 => targets.to_dtype(DType::U32)?,
        dtype => {
            return Err(TrainingError::runtime(format!(
                "unsupported target dtype {:?} for span loss",
                dtype
            )))
        }
    };

    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let nll = log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .neg()?
        .squeeze(1)?;
    Ok(nll.mean_all()?)
}
