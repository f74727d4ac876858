use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config, TrainingError};

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl AdamWConfig {
    /// Takes moments and epsilon from the config and the (possibly scaled) base rate
    /// from the caller.
    pub fn from_config(value: &config::OptimizerConfig, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
        }
    }
}

/// Parameters sharing one weight-decay coefficient.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub weight_decay: f64,
    pub parameters: Vec<(String, Var)>,
}

/// Splits parameters into a decayed group and an undecayed group. A parameter lands
/// in the undecayed group when its name contains any of `no_decay`.
pub fn build_param_groups(
    named_parameters: Vec<(String, Var)>,
    no_decay: &[String],
    weight_decay: f64,
) -> Vec<ParamGroup> {
    let (exempt, decayed): (Vec<_>, Vec<_>) = named_parameters
        .into_iter()
        .partition(|(name, _)| !should_apply_weight_decay(name, no_decay));
    vec![
        ParamGroup {
            weight_decay,
            parameters: decayed,
        },
        ParamGroup {
            weight_decay: 0.0,
            parameters: exempt,
        },
    ]
}

/// AdamW with bias correction and decoupled weight decay, applied per group.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    weight_decay: f64,
    step: i32,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(groups: Vec<ParamGroup>, config: AdamWConfig) -> Result<Self, TrainingError> {
        let mut params = Vec::new();
        for group in groups {
            for (name, var) in group.parameters {
                let tensor = var.as_tensor();
                if !tensor.dtype().is_float() {
                    return Err(TrainingError::initialization(format!(
                        "optimizer received non-floating parameter '{}'",
                        name
                    )));
                }
                let shape = tensor.dims().to_vec();
                let device = tensor.device();
                params.push(ParameterSlot {
                    first_moment: Tensor::zeros(shape.as_slice(), DType::F32, device)?,
                    second_moment: Tensor::zeros(shape.as_slice(), DType::F32, device)?,
                    dtype: tensor.dtype(),
                    weight_decay: group.weight_decay,
                    step: 0,
                    name,
                    param: var,
                });
            }
        }

        if params.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Weight decay applied to `name`, if the optimizer tracks it.
    pub fn weight_decay_for(&self, name: &str) -> Option<f64> {
        self.params
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.weight_decay)
    }

    /// Applies one update from `grads`, consuming the gradients it uses. Parameters
    /// without a gradient are left untouched and keep their own step count, which
    /// drives bias correction.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut pending = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                pending.push((index, grad.to_dtype(DType::F32)?));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let cfg = self.config;

        for (index, grad) in pending {
            let slot = &mut self.params[index];
            slot.step += 1;
            let bias_correction1 = 1.0 - cfg.beta1.powi(slot.step);
            let bias_correction2 = 1.0 - cfg.beta2.powi(slot.step);
            let step_size = cfg.learning_rate * bias_correction2.sqrt() / bias_correction1;

            let new_m = (slot.first_moment.affine(cfg.beta1, 0.0)?
                + grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = (slot.second_moment.affine(cfg.beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let denom = new_v.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = new_m.div(&denom)?.affine(step_size, 0.0)?;

            let base = slot.param.as_tensor().to_dtype(DType::F32)?;
            let mut next = base.sub(&update)?;
            if slot.weight_decay != 0.0 {
                next = next.affine(1.0 - cfg.learning_rate * slot.weight_decay, 0.0)?;
            }

            let next = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype)?
            };
            slot.param.set(&next)?;
            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }
}

fn should_apply_weight_decay(name: &str, exclusions: &[String]) -> bool {
    !exclusions
        .iter()
        .any(|pattern| matches_pattern(name, pattern))
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    !pattern.is_empty() && name.contains(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    fn patterns() -> Vec<String> {
        config::OptimizerConfig::default().no_decay
    }

    #[test]
    fn groups_exempt_biases_and_layer_norms() {
        let named = vec![
            ("roberta.encoder.layer.0.attention.self.query.weight".to_string(), var(&[1.0])),
            ("roberta.encoder.layer.0.attention.self.query.bias".to_string(), var(&[1.0])),
            ("roberta.embeddings.LayerNorm.weight".to_string(), var(&[1.0])),
            ("qa_outputs.weight".to_string(), var(&[1.0])),
        ];
        let groups = build_param_groups(named, &patterns(), 0.001);

        let decayed: Vec<_> = groups[0].parameters.iter().map(|(n, _)| n.as_str()).collect();
        let exempt: Vec<_> = groups[1].parameters.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(groups[0].weight_decay, 0.001);
        assert_eq!(groups[1].weight_decay, 0.0);
        assert_eq!(
            decayed,
            vec![
                "roberta.encoder.layer.0.attention.self.query.weight",
                "qa_outputs.weight"
            ]
        );
        assert_eq!(
            exempt,
            vec![
                "roberta.encoder.layer.0.attention.self.query.bias",
                "roberta.embeddings.LayerNorm.weight"
            ]
        );
    }

    #[test]
    fn first_step_moves_each_weight_by_learning_rate() {
        let weight = var(&[1.0, -1.0]);
        let groups = vec![ParamGroup {
            weight_decay: 0.0,
            parameters: vec![("w".to_string(), weight.clone())],
        }];
        let cfg = AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        };
        let mut optimizer = TrainerOptimizer::new(groups, cfg).unwrap();

        let loss = weight.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        let values = weight.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.9).abs() < 1e-5);
        assert!((values[1] + 0.9).abs() < 1e-5);
        assert_eq!(optimizer.steps_taken(), 1);
    }

    #[test]
    fn decay_only_applies_to_decayed_group() {
        let decayed = var(&[1.0]);
        let exempt = var(&[1.0]);
        let groups = build_param_groups(
            vec![
                ("dense.weight".to_string(), decayed.clone()),
                ("dense.bias".to_string(), exempt.clone()),
            ],
            &patterns(),
            0.5,
        );
        let cfg = AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-6,
        };
        let mut optimizer = TrainerOptimizer::new(groups, cfg).unwrap();
        assert_eq!(optimizer.weight_decay_for("dense.weight"), Some(0.5));
        assert_eq!(optimizer.weight_decay_for("dense.bias"), Some(0.0));

        // zero gradients isolate the decay term
        let zeros = Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let loss = (decayed.as_tensor().mul(&zeros).unwrap()
            + exempt.as_tensor().mul(&zeros).unwrap())
        .unwrap()
        .sum_all()
        .unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        let decayed = decayed.as_tensor().to_vec1::<f32>().unwrap()[0];
        let exempt = exempt.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((decayed - 0.95).abs() < 1e-6);
        assert!((exempt - 1.0).abs() < 1e-6);
    }

    #[test]
    fn bias_correction_counts_steps_per_parameter() {
        let early = var(&[1.0]);
        let late = var(&[1.0]);
        let groups = vec![ParamGroup {
            weight_decay: 0.0,
            parameters: vec![
                ("early".to_string(), early.clone()),
                ("late".to_string(), late.clone()),
            ],
        }];
        let cfg = AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        };
        let mut optimizer = TrainerOptimizer::new(groups, cfg).unwrap();

        let mut grads = early.as_tensor().sum_all().unwrap().backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        assert_eq!(late.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);

        // first update for `late` is fully bias corrected: exactly lr * sign(grad)
        let mut grads = late.as_tensor().sum_all().unwrap().backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        let moved = late.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((moved - 0.9).abs() < 1e-5, "{moved}");
        assert_eq!(optimizer.steps_taken(), 2);
    }

    #[test]
    fn empty_groups_are_rejected() {
        let cfg = AdamWConfig::from_config(&config::OptimizerConfig::default(), 3e-5);
        assert!(TrainerOptimizer::new(Vec::new(), cfg).is_err());
    }
}
