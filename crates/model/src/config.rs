use candle_core::{Error, Result};

/// Hyperparameters of the RoBERTa-style encoder and its span head.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    /// First position id handed to the position embedding table (RoBERTa reserves
    /// `pad_token_id + 1` slots).
    pub position_offset: usize,
    pub layer_norm_eps: f64,
    pub hidden_dropout: f32,
    pub attention_dropout: f32,
    pub head_dropout: f32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50_265,
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            intermediate_size: 3_072,
            max_position_embeddings: 514,
            type_vocab_size: 1,
            position_offset: 2,
            layer_norm_eps: 1e-5,
            hidden_dropout: 0.1,
            attention_dropout: 0.1,
            head_dropout: 0.1,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_size == 0 {
            return Err(Error::Msg("hidden_size must be greater than zero".into()));
        }
        if self.num_layers == 0 {
            return Err(Error::Msg("num_layers must be greater than zero".into()));
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if self.intermediate_size == 0 {
            return Err(Error::Msg(
                "intermediate_size must be greater than zero".into(),
            ));
        }
        if self.type_vocab_size == 0 {
            return Err(Error::Msg("type_vocab_size must be greater than zero".into()));
        }
        if self.max_position_embeddings <= self.position_offset {
            return Err(Error::Msg(format!(
                "max_position_embeddings ({}) must exceed position_offset ({})",
                self.max_position_embeddings, self.position_offset
            )));
        }
        for (label, p) in [
            ("hidden_dropout", self.hidden_dropout),
            ("attention_dropout", self.attention_dropout),
            ("head_dropout", self.head_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg(format!("{label} must be in [0, 1)")));
            }
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Longest sequence the position table can embed.
    pub fn max_sequence_length(&self) -> usize {
        self.max_position_embeddings - self.position_offset
    }
}
