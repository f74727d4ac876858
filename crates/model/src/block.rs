use candle_core::{Module, Result, Tensor, D};
use candle_nn::{linear, ops, Dropout, Init, Linear, VarBuilder};

use crate::config::EncoderConfig;

/// Layer normalisation with learned scale and shift, composed from primitive ops so
/// it stays differentiable on every backend.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (variance + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&denom)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Post-norm transformer encoder layer: self-attention then a GELU feed-forward,
/// each followed by a residual connection and layer norm.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    query: Linear,
    key: Linear,
    value: Linear,
    attention_output: Linear,
    attention_norm: LayerNorm,
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
    hidden_dropout: Dropout,
    attention_dropout: Dropout,
}

impl EncoderLayer {
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let attention = vb.pp("attention");
        let projections = attention.pp("self");
        let attention_out = attention.pp("output");
        let output = vb.pp("output");

        Ok(Self {
            query: linear(hidden, hidden, projections.pp("query"))?,
            key: linear(hidden, hidden, projections.pp("key"))?,
            value: linear(hidden, hidden, projections.pp("value"))?,
            attention_output: linear(hidden, hidden, attention_out.pp("dense"))?,
            attention_norm: LayerNorm::new(
                hidden,
                config.layer_norm_eps,
                attention_out.pp("LayerNorm"),
            )?,
            intermediate: linear(
                hidden,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            output: linear(config.intermediate_size, hidden, output.pp("dense"))?,
            output_norm: LayerNorm::new(hidden, config.layer_norm_eps, output.pp("LayerNorm"))?,
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
            hidden_dropout: Dropout::new(config.hidden_dropout),
            attention_dropout: Dropout::new(config.attention_dropout),
        })
    }

    /// `attention_bias` is additive and broadcastable to `(batch, heads, seq, seq)`.
    pub fn forward(&self, hidden: &Tensor, attention_bias: &Tensor, train: bool) -> Result<Tensor> {
        let (batch, seq, width) = hidden.dims3()?;
        let split_heads = |xs: Tensor| -> Result<Tensor> {
            xs.reshape((batch, seq, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };

        let query = split_heads(self.query.forward(hidden)?)?;
        let key = split_heads(self.key.forward(hidden)?)?;
        let value = split_heads(self.value.forward(hidden)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (query.matmul(&key.t()?.contiguous()?)? * scale)?;
        let scores = scores.broadcast_add(attention_bias)?;
        let probs = ops::softmax(&scores, D::Minus1)?;
        let probs = self.attention_dropout.forward(&probs, train)?;

        let context = probs
            .matmul(&value)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, width))?;
        let attended = self
            .hidden_dropout
            .forward(&self.attention_output.forward(&context)?, train)?;
        let hidden = self.attention_norm.forward(&(attended + hidden)?)?;

        let inner = self.intermediate.forward(&hidden)?.gelu_erf()?;
        let projected = self
            .hidden_dropout
            .forward(&self.output.forward(&inner)?, train)?;
        self.output_norm.forward(&(projected + hidden)?)
    }
}
