pub mod block;
pub mod config;
pub mod model;
pub mod span;

pub use block::{EncoderLayer, LayerNorm};
pub use config::EncoderConfig;
pub use model::{EncoderFactory, EncoderSpanModel, PretrainedReport};
pub use span::{ModelFactory, SpanLogits, SpanModel};
