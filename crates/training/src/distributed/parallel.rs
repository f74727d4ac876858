use std::sync::Arc;

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use span_model::{SpanLogits, SpanModel};

use crate::{distributed::group::ProcessGroup, TrainingError};

/// A model prepared for one of the execution layouts.
///
/// * single device: plain pass-through;
/// * data parallel: the batch is split across replicas living on other devices,
///   logits are gathered on the primary device, replica gradients are summed into
///   the primary's and updated weights are copied back after each step;
/// * distributed: gradients are averaged across processes after every backward.
pub struct ParallelModel<M: SpanModel> {
    primary: M,
    params: Vec<(String, Var)>,
    replicas: Vec<Replica<M>>,
    group: Option<Arc<dyn ProcessGroup>>,
}

struct Replica<M> {
    model: M,
    params: Vec<Var>,
}

impl<M: SpanModel> ParallelModel<M> {
    pub fn single(model: M) -> Self {
        let params = model.named_parameters();
        Self {
            primary: model,
            params,
            replicas: Vec::new(),
            group: None,
        }
    }

    /// Wraps `primary` with replicas built elsewhere; replica weights are overwritten
    /// with the primary's.
    pub fn data_parallel(primary: M, replicas: Vec<M>) -> Result<Self, TrainingError> {
        let params = primary.named_parameters();
        let mut wrapped = Vec::with_capacity(replicas.len());
        for model in replicas {
            let named = model.named_parameters();
            if named.len() != params.len()
                || named.iter().zip(&params).any(|((a, _), (b, _))| a != b)
            {
                return Err(TrainingError::initialization(
                    "data parallel replica parameters do not match the primary model",
                ));
            }
            wrapped.push(Replica {
                model,
                params: named.into_iter().map(|(_, var)| var).collect(),
            });
        }
        let model = Self {
            primary,
            params,
            replicas: wrapped,
            group: None,
        };
        model.sync_replicas()?;
        Ok(model)
    }

    /// Wraps `model` for multi-process training, starting every rank from rank 0's
    /// weights.
    pub fn distributed(model: M, group: Arc<dyn ProcessGroup>) -> Result<Self, TrainingError> {
        let params = model.named_parameters();
        let mut flat = flatten(params.iter().map(|(_, var)| var.as_tensor().clone()))?;
        group.broadcast(&mut flat, 0)?;
        let mut offset = 0;
        for (_, var) in &params {
            let tensor = unflatten(&flat, &mut offset, var.as_tensor())?;
            var.set(&tensor)?;
        }
        Ok(Self {
            primary: model,
            params,
            replicas: Vec::new(),
            group: Some(group),
        })
    }

    pub fn module(&self) -> &M {
        &self.primary
    }

    /// Models taking part in a forward pass, primary first.
    pub fn replica_count(&self) -> usize {
        1 + self.replicas.len()
    }

    /// Folds replica gradients into the primary's (data parallel) or averages
    /// gradients across processes (distributed). Single-device models are untouched.
    pub fn synchronize_gradients(&self, grads: &mut GradStore) -> Result<(), TrainingError> {
        if !self.replicas.is_empty() {
            let device = self.primary.device();
            for (index, (_, var)) in self.params.iter().enumerate() {
                let mut total = grads.remove(var.as_tensor());
                for replica in &self.replicas {
                    if let Some(grad) = grads.remove(replica.params[index].as_tensor()) {
                        let grad = grad.to_device(device)?;
                        total = Some(match total {
                            Some(sum) => (sum + grad)?,
                            None => grad,
                        });
                    }
                }
                if let Some(total) = total {
                    grads.insert(var.as_tensor(), total);
                }
            }
        }

        if let Some(group) = &self.group {
            // Missing gradients count as zeros so every rank sends equal frames. One
            // presence flag per parameter trails the buffer; a parameter no rank
            // produced a gradient for stays without one.
            let mut grad_tensors = Vec::with_capacity(self.params.len());
            let mut present = Vec::with_capacity(self.params.len());
            for (_, var) in &self.params {
                let tensor = var.as_tensor();
                match grads.get(tensor) {
                    Some(grad) => {
                        grad_tensors.push(grad.clone());
                        present.push(1.0f32);
                    }
                    None => {
                        grad_tensors.push(tensor.zeros_like()?);
                        present.push(0.0);
                    }
                }
            }
            let mut flat = flatten(grad_tensors)?;
            flat.extend_from_slice(&present);
            group.all_reduce_mean(&mut flat)?;

            let flags = flat.split_off(flat.len() - present.len());
            let mut offset = 0;
            for ((_, var), flag) in self.params.iter().zip(flags) {
                let averaged = unflatten(&flat, &mut offset, var.as_tensor())?;
                if flag > 0.0 {
                    grads.insert(var.as_tensor(), averaged);
                }
            }
        }
        Ok(())
    }

    /// Pushes the primary's weights to every replica. Called after each optimizer step.
    pub fn sync_replicas(&self) -> Result<(), TrainingError> {
        for replica in &self.replicas {
            let device = replica.model.device();
            for ((_, source), target) in self.params.iter().zip(&replica.params) {
                target.set(&source.as_tensor().to_device(device)?)?;
            }
        }
        Ok(())
    }

    fn scatter_forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        token_type_ids: &Tensor,
    ) -> candle_core::Result<SpanLogits> {
        let rows = input_ids.dim(0)?;
        let shards = self.replica_count().min(rows).max(1);
        let chunk = rows.div_ceil(shards);
        let home = self.primary.device();

        let models = std::iter::once(&self.primary).chain(self.replicas.iter().map(|r| &r.model));
        let mut starts = Vec::with_capacity(shards);
        let mut ends = Vec::with_capacity(shards);
        for (index, model) in models.enumerate() {
            let offset = index * chunk;
            if offset >= rows {
                break;
            }
            let len = chunk.min(rows - offset);
            let device = model.device();
            let logits = model.forward(
                &input_ids.narrow(0, offset, len)?.to_device(device)?,
                &attention_mask.narrow(0, offset, len)?.to_device(device)?,
                &token_type_ids.narrow(0, offset, len)?.to_device(device)?,
            )?;
            starts.push(logits.start.to_device(home)?);
            ends.push(logits.end.to_device(home)?);
        }

        Ok(SpanLogits {
            start: Tensor::cat(&starts, 0)?,
            end: Tensor::cat(&ends, 0)?,
        })
    }
}

impl<M: SpanModel> SpanModel for ParallelModel<M> {
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        token_type_ids: &Tensor,
    ) -> candle_core::Result<SpanLogits> {
        if self.replicas.is_empty() {
            self.primary
                .forward(input_ids, attention_mask, token_type_ids)
        } else {
            self.scatter_forward(input_ids, attention_mask, token_type_ids)
        }
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.params.clone()
    }

    fn set_training(&self, training: bool) {
        self.primary.set_training(training);
        for replica in &self.replicas {
            replica.model.set_training(training);
        }
    }

    fn device(&self) -> &Device {
        self.primary.device()
    }
}

fn flatten(tensors: impl IntoIterator<Item = Tensor>) -> Result<Vec<f32>, TrainingError> {
    let mut flat = Vec::new();
    for tensor in tensors {
        let values = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        flat.extend(values);
    }
    Ok(flat)
}

fn unflatten(flat: &[f32], offset: &mut usize, like: &Tensor) -> Result<Tensor, TrainingError> {
    let count = like.elem_count();
    let end = *offset + count;
    let slice = flat.get(*offset..end).ok_or_else(|| {
        TrainingError::runtime("flattened buffer shorter than the parameter set")
    })?;
    *offset = end;
    Ok(Tensor::from_slice(slice, like.dims(), like.device())?.to_dtype(like.dtype())?)
}
