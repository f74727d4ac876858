use candle_core::{Device, Result, Tensor, Var};

/// Start and end scores over token positions, each shaped `(batch, seq_len)`.
#[derive(Debug, Clone)]
pub struct SpanLogits {
    pub start: Tensor,
    pub end: Tensor,
}

/// A model that scores every token position as a span start and a span end.
///
/// The training loop treats implementors as black boxes: it only feeds token ids,
/// the attention mask and segment ids, and reads back two logit matrices.
pub trait SpanModel {
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        token_type_ids: &Tensor,
    ) -> Result<SpanLogits>;

    /// Trainable parameters sorted by name. Names are stable across processes and
    /// are used as checkpoint keys.
    fn named_parameters(&self) -> Vec<(String, Var)>;

    /// Switches stochastic layers (dropout) on or off.
    fn set_training(&self, training: bool);

    fn device(&self) -> &Device;
}

/// Builds fresh model instances on a requested device.
pub trait ModelFactory {
    type Model: SpanModel;

    fn build(&self, device: &Device) -> Result<Self::Model>;
}
