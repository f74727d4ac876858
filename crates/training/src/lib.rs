pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod early_stopping;
pub mod epoch;
pub mod fold;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod scoring;
pub mod step;

pub use checkpoint::{restore_model_weights, CheckpointManifest, FoldSnapshot, ModelSnapshot};
pub use config::{TrainingConfig, TrainingError};
pub use data::{SpanBatch, SpanDataLoader, SpanDataset, SpanEncoder, SpanRow};
pub use distributed::{DistributedContext, ParallelMode, ParallelModel, ParallelStrategy, ProcessGroup};
pub use early_stopping::{EarlyStopping, Observation, StopMode};
pub use epoch::{run_epoch, EpochLabel, EpochMode};
pub use fold::{run_fold, run_training, train_fold, EpochRecord, FoldOutcome};
pub use logging::{Logger, LoggingSettings};
pub use loss::{span_loss, LossOutput, SpanLoss};
pub use metrics::{EpochMetrics, EpochSummary, RunningAverage};
pub use optimizer::{build_param_groups, AdamWConfig, ParamGroup, TrainerOptimizer};
pub use scheduler::{LRScheduler, LinearWarmupDecay};
pub use scoring::{character_overlap_score, extract_span_text, predict_span, SpanPrediction};
pub use step::{eval_step, train_step, StepOutput};
