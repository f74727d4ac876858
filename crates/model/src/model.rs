use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use candle_core::{DType, Device, Error, Module, Result, Tensor, Var, D};
use candle_nn::{embedding, linear, Dropout, Embedding, Linear, VarBuilder, VarMap};

use crate::{
    block::{EncoderLayer, LayerNorm},
    config::EncoderConfig,
    span::{ModelFactory, SpanLogits, SpanModel},
};

/// RoBERTa-style encoder with a span head over the last two hidden states.
///
/// Parameters live in a [`VarMap`] under Hugging Face names (`roberta.embeddings.*`,
/// `roberta.encoder.layer.N.*`, `qa_outputs.*`) so pretrained encoder weights can be
/// loaded with [`EncoderSpanModel::load_pretrained`].
pub struct EncoderSpanModel {
    config: EncoderConfig,
    varmap: VarMap,
    device: Device,
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    embedding_norm: LayerNorm,
    embedding_dropout: Dropout,
    layers: Vec<EncoderLayer>,
    head_dropout: Dropout,
    qa_outputs: Linear,
    training: AtomicBool,
}

/// Outcome of a lenient pretrained-weight load.
#[derive(Debug, Clone, Default)]
pub struct PretrainedReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub unused: usize,
}

impl EncoderSpanModel {
    pub fn new(config: EncoderConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let encoder = vb.pp("roberta");
        let embeddings = encoder.pp("embeddings");
        let hidden = config.hidden_size;

        let word_embeddings =
            embedding(config.vocab_size, hidden, embeddings.pp("word_embeddings"))?;
        let position_embeddings = embedding(
            config.max_position_embeddings,
            hidden,
            embeddings.pp("position_embeddings"),
        )?;
        let token_type_embeddings = embedding(
            config.type_vocab_size,
            hidden,
            embeddings.pp("token_type_embeddings"),
        )?;
        let embedding_norm =
            LayerNorm::new(hidden, config.layer_norm_eps, embeddings.pp("LayerNorm"))?;

        let layer_vb = encoder.pp("encoder").pp("layer");
        let mut layers = Vec::with_capacity(config.num_layers);
        for index in 0..config.num_layers {
            layers.push(EncoderLayer::new(&config, layer_vb.pp(index.to_string()))?);
        }

        let qa_outputs = linear(hidden * 2, 2, vb.pp("qa_outputs"))?;

        Ok(Self {
            embedding_dropout: Dropout::new(config.hidden_dropout),
            head_dropout: Dropout::new(config.head_dropout),
            config,
            varmap,
            device: device.clone(),
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            embedding_norm,
            layers,
            qa_outputs,
            training: AtomicBool::new(true),
        })
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Copies every tensor of `path` whose name matches a parameter. Parameters the
    /// file lacks (typically the span head) keep their fresh initialisation.
    pub fn load_pretrained(&self, path: impl AsRef<Path>) -> Result<PretrainedReport> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, &self.device)?;
        let mut report = PretrainedReport::default();

        for (name, var) in self.named_parameters() {
            let Some(tensor) = tensors.remove(&name) else {
                report.missing.push(name);
                continue;
            };
            if tensor.dims() != var.as_tensor().dims() {
                return Err(Error::Msg(format!(
                    "pretrained tensor {name} has shape {:?}, expected {:?}",
                    tensor.dims(),
                    var.as_tensor().dims()
                )));
            }
            var.set(&tensor.to_dtype(var.as_tensor().dtype())?)?;
            report.loaded.push(name);
        }
        report.unused = tensors.len();

        Ok(report)
    }

    fn embed(&self, input_ids: &Tensor, token_type_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_, seq) = input_ids.dims2()?;
        if seq > self.config.max_sequence_length() {
            return Err(Error::Msg(format!(
                "sequence length {seq} exceeds the position table ({})",
                self.config.max_sequence_length()
            )));
        }

        let first = self.config.position_offset as u32;
        let positions = Tensor::arange(first, first + seq as u32, &self.device)?;
        let words = self.word_embeddings.forward(input_ids)?;
        let positions = self.position_embeddings.forward(&positions)?;
        let segments = self.token_type_embeddings.forward(token_type_ids)?;

        let summed = words.broadcast_add(&positions)?.add(&segments)?;
        let normed = self.embedding_norm.forward(&summed)?;
        self.embedding_dropout.forward(&normed, train)
    }
}

impl SpanModel for EncoderSpanModel {
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        token_type_ids: &Tensor,
    ) -> Result<SpanLogits> {
        let train = self.is_training();
        let (batch, seq) = input_ids.dims2()?;

        // 0 for attended positions, a large negative bias for padding.
        let attention_bias = attention_mask
            .to_dtype(DType::F32)?
            .affine(10_000.0, -10_000.0)?
            .reshape((batch, 1, 1, seq))?;

        let mut previous = self.embed(input_ids, token_type_ids, train)?;
        let mut hidden = previous.clone();
        for layer in &self.layers {
            previous = hidden;
            hidden = layer.forward(&previous, &attention_bias, train)?;
        }

        let features = Tensor::cat(&[&hidden, &previous], D::Minus1)?;
        let features = self.head_dropout.forward(&features, train)?;
        let logits = self.qa_outputs.forward(&features)?;

        Ok(SpanLogits {
            start: logits.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?.contiguous()?,
            end: logits.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?.contiguous()?,
        })
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Builds [`EncoderSpanModel`]s, optionally seeded from a pretrained checkpoint.
#[derive(Debug, Clone)]
pub struct EncoderFactory {
    pub config: EncoderConfig,
    pub pretrained: Option<PathBuf>,
}

impl EncoderFactory {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            pretrained: None,
        }
    }

    pub fn with_pretrained(mut self, path: impl Into<PathBuf>) -> Self {
        self.pretrained = Some(path.into());
        self
    }
}

impl ModelFactory for EncoderFactory {
    type Model = EncoderSpanModel;

    fn build(&self, device: &Device) -> Result<Self::Model> {
        let model = EncoderSpanModel::new(self.config.clone(), device)?;
        if let Some(path) = &self.pretrained {
            let report = model.load_pretrained(path)?;
            if report.loaded.is_empty() {
                return Err(Error::Msg(format!(
                    "no parameters matched pretrained weights at {}",
                    path.display()
                )));
            }
        }
        Ok(model)
    }
}
