use serde::{Deserialize, Serialize};
use span_model::EncoderConfig;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data: DataConfig,
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        let has_pair = self.tokenizer.vocab.is_some() && self.tokenizer.merges.is_some();
        if self.tokenizer.tokenizer_json.is_none() && !has_pair {
            errors.push(
                "tokenizer must provide `tokenizer_json` or both `vocab` and `merges`".to_string(),
            );
        }

        if self.data.training_file.as_os_str().is_empty() {
            errors.push("data.training_file must not be empty".to_string());
        }

        if self.data.max_len < MIN_SEQUENCE_LENGTH {
            errors.push(format!(
                "data.max_len must be at least {} (got {})",
                MIN_SEQUENCE_LENGTH, self.data.max_len
            ));
        }

        let position_capacity = self
            .model
            .max_position_embeddings
            .saturating_sub(self.model.position_offset);
        if self.data.max_len > position_capacity {
            errors.push(format!(
                "data.max_len ({}) exceeds model position capacity ({})",
                self.data.max_len, position_capacity
            ));
        }

        if self.data.train_batch_size == 0 {
            errors.push("data.train_batch_size must be greater than 0".to_string());
        }

        if self.data.valid_batch_size == 0 {
            errors.push("data.valid_batch_size must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }

        if self.runtime.patience == 0 {
            errors.push("runtime.patience must be greater than 0".to_string());
        }

        if self.runtime.min_delta < 0.0 {
            errors.push("runtime.min_delta must be >= 0".to_string());
        }

        if self.runtime.folds.is_empty() {
            errors.push("runtime.folds must list at least one fold".to_string());
        }

        if self.runtime.checkpoint_dir.as_os_str().is_empty() {
            errors.push("runtime.checkpoint_dir must not be empty".to_string());
        }

        for (label, p) in [
            ("model.hidden_dropout", self.model.hidden_dropout),
            ("model.attention_dropout", self.model.attention_dropout),
            ("model.head_dropout", self.model.head_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("{} must be in [0, 1) (got {})", label, p));
            }
        }

        if self.model.num_heads == 0 || self.model.hidden_size % self.model.num_heads != 0 {
            errors.push("model.hidden_size must be divisible by model.num_heads".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.tokenizer.apply_base_path(base);
        self.data.apply_base_path(base);
        self.model.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub training_file: PathBuf,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
    #[serde(default = "default_valid_batch_size")]
    pub valid_batch_size: usize,
    /// Threads collating batches ahead of the training loop; 0 collates inline.
    #[serde(default)]
    pub num_workers: usize,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.training_file, base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default)]
    pub tokenizer_json: Option<PathBuf>,
    #[serde(default)]
    pub vocab: Option<PathBuf>,
    #[serde(default)]
    pub merges: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub lowercase: bool,
    #[serde(default = "default_true")]
    pub add_prefix_space: bool,
}

impl TokenizerConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            self.tokenizer_json.as_mut(),
            self.vocab.as_mut(),
            self.merges.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Safetensors file with encoder weights to start fine-tuning from.
    #[serde(default)]
    pub pretrained_weights: Option<PathBuf>,
    /// Defaults to the tokenizer vocabulary size.
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_position_offset")]
    pub position_offset: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_dropout")]
    pub hidden_dropout: f32,
    #[serde(default = "default_dropout")]
    pub attention_dropout: f32,
    #[serde(default = "default_dropout")]
    pub head_dropout: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            pretrained_weights: None,
            vocab_size: None,
            hidden_size: default_hidden_size(),
            num_layers: default_num_layers(),
            num_heads: default_num_heads(),
            intermediate_size: default_intermediate_size(),
            max_position_embeddings: default_max_position_embeddings(),
            type_vocab_size: default_type_vocab_size(),
            position_offset: default_position_offset(),
            layer_norm_eps: default_layer_norm_eps(),
            hidden_dropout: default_dropout(),
            attention_dropout: default_dropout(),
            head_dropout: default_dropout(),
        }
    }
}

impl ModelSettings {
    pub fn to_encoder_config(&self, tokenizer_vocab_size: usize) -> EncoderConfig {
        EncoderConfig {
            vocab_size: self.vocab_size.unwrap_or(tokenizer_vocab_size),
            hidden_size: self.hidden_size,
            num_layers: self.num_layers,
            num_heads: self.num_heads,
            intermediate_size: self.intermediate_size,
            max_position_embeddings: self.max_position_embeddings,
            type_vocab_size: self.type_vocab_size,
            position_offset: self.position_offset,
            layer_norm_eps: self.layer_norm_eps,
            hidden_dropout: self.hidden_dropout,
            attention_dropout: self.attention_dropout,
            head_dropout: self.head_dropout,
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        if let Some(path) = self.pretrained_weights.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Parameters whose name contains any of these patterns are not decayed.
    #[serde(default = "default_no_decay")]
    pub no_decay: Vec<String>,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub lr_scaling: LrScaling,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            no_decay: default_no_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            lr_scaling: LrScaling::default(),
        }
    }
}

/// How the configured learning rate is adjusted for multi-device execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LrScaling {
    None,
    #[default]
    DeviceCount,
}

impl LrScaling {
    pub fn apply(self, base_lr: f64, device_count: usize) -> f64 {
        match self {
            LrScaling::None => base_lr,
            LrScaling::DeviceCount => base_lr * device_count.max(1) as f64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warmup_steps: default_warmup_steps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default)]
    pub min_delta: f64,
    #[serde(default = "default_folds")]
    pub folds: Vec<usize>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default)]
    pub parallel: ParallelPreference,
    /// Overrides `LOCAL_RANK` from the launcher environment.
    #[serde(default)]
    pub local_rank: Option<usize>,
    /// CUDA ordinals used for single-process data parallelism; empty probes all.
    #[serde(default)]
    pub devices: Vec<usize>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            patience: default_patience(),
            min_delta: 0.0,
            folds: default_folds(),
            seed: default_seed(),
            checkpoint_dir: default_checkpoint_dir(),
            parallel: ParallelPreference::default(),
            local_rank: None,
            devices: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint_dir, base);
        if let Some(dir) = self.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

/// Requested execution layout; `Auto` picks distributed when launched with a world
/// size above one, data parallel when several accelerators are visible, otherwise a
/// single device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParallelPreference {
    #[default]
    Auto,
    SingleDevice,
    DataParallel,
    Distributed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default = "default_true")]
    pub progress_bar: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            progress_bar: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

/// `<s> sentiment </s> </s>` + one text token + `</s>`.
pub const MIN_SEQUENCE_LENGTH: usize = 6;

fn default_true() -> bool {
    true
}

fn default_max_len() -> usize {
    160
}

fn default_train_batch_size() -> usize {
    16
}

fn default_valid_batch_size() -> usize {
    8
}

fn default_hidden_size() -> usize {
    768
}

fn default_num_layers() -> usize {
    12
}

fn default_num_heads() -> usize {
    12
}

fn default_intermediate_size() -> usize {
    3_072
}

fn default_max_position_embeddings() -> usize {
    514
}

fn default_type_vocab_size() -> usize {
    1
}

fn default_position_offset() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_dropout() -> f32 {
    0.1
}

fn default_learning_rate() -> f64 {
    3e-5
}

fn default_weight_decay() -> f64 {
    0.001
}

fn default_no_decay() -> Vec<String> {
    vec![
        "bias".to_string(),
        "LayerNorm.bias".to_string(),
        "LayerNorm.weight".to_string(),
    ]
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-6
}

fn default_warmup_steps() -> usize {
    200
}

fn default_epochs() -> usize {
    5
}

fn default_patience() -> usize {
    3
}

fn default_folds() -> Vec<usize> {
    (0..5).collect()
}

fn default_seed() -> u64 {
    42
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("bin")
}

fn default_tensorboard_flush_every_n() -> usize {
    50
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    Data(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::Data(msg) => write!(f, "invalid training data: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_) | TrainingError::Validation(_) => None,
            TrainingError::Initialization(_)
            | TrainingError::Runtime(_)
            | TrainingError::Data(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

impl From<csv::Error> for TrainingError {
    fn from(value: csv::Error) -> Self {
        TrainingError::Data(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [data]
        training_file = "train-kfolds/train_5folds.csv"

        [tokenizer]
        vocab = "roberta/vocab.json"
        merges = "roberta/merges.txt"
    "#;

    #[test]
    fn defaults_follow_reference_run() {
        let config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.data.max_len, 160);
        assert_eq!(config.data.train_batch_size, 16);
        assert_eq!(config.data.valid_batch_size, 8);
        assert_eq!(config.runtime.epochs, 5);
        assert_eq!(config.runtime.patience, 3);
        assert_eq!(config.runtime.folds, vec![0, 1, 2, 3, 4]);
        assert_eq!(config.scheduler.warmup_steps, 200);
        assert!((config.optimizer.learning_rate - 3e-5).abs() < 1e-12);
        assert!((config.optimizer.weight_decay - 0.001).abs() < 1e-12);
        assert_eq!(config.optimizer.lr_scaling, LrScaling::DeviceCount);
        config.validate().unwrap();
    }

    #[test]
    fn from_path_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, MINIMAL).unwrap();

        let config = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(
            config.data.training_file,
            dir.path().join("train-kfolds/train_5folds.csv")
        );
        assert_eq!(config.runtime.checkpoint_dir, dir.path().join("bin"));
    }

    #[test]
    fn validation_collects_every_violation() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.data.train_batch_size = 0;
        config.runtime.patience = 0;
        config.data.max_len = 600;

        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 3),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn lr_scaling_multiplies_by_device_count() {
        assert_eq!(LrScaling::None.apply(3e-5, 4), 3e-5);
        assert!((LrScaling::DeviceCount.apply(3e-5, 4) - 1.2e-4).abs() < 1e-12);
        assert_eq!(LrScaling::DeviceCount.apply(1.0, 0), 1.0);
    }
}
