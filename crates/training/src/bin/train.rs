use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use serde_json::{Map, Number, Value};
use span_model::EncoderFactory;
use span_training::{
    run_training, DistributedContext, Logger, LoggingSettings, SpanEncoder, TrainingConfig,
    TrainingError,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Cross-validated span extraction fine-tuning",
    long_about = None
)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long = "max_len", help = "Maximum token sequence length")]
    max_len: Option<usize>,

    #[arg(long = "train_batch_size")]
    train_batch_size: Option<usize>,

    #[arg(long = "valid_batch_size")]
    valid_batch_size: Option<usize>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long, help = "Base learning rate before device-count scaling")]
    lr: Option<f64>,

    #[arg(long, help = "Epochs without improvement before a fold stops")]
    patience: Option<usize>,

    #[arg(long = "num_warmup_steps")]
    num_warmup_steps: Option<usize>,

    #[arg(long = "local_rank", help = "Device index of this process (set by launchers)")]
    local_rank: Option<usize>,

    #[arg(long = "fold", value_name = "FOLD", help = "Train only these folds (repeatable)")]
    folds: Vec<usize>,
}

impl Args {
    fn apply_to(&self, config: &mut TrainingConfig) {
        if let Some(max_len) = self.max_len {
            config.data.max_len = max_len;
        }
        if let Some(size) = self.train_batch_size {
            config.data.train_batch_size = size;
        }
        if let Some(size) = self.valid_batch_size {
            config.data.valid_batch_size = size;
        }
        if let Some(epochs) = self.epochs {
            config.runtime.epochs = epochs;
        }
        if let Some(lr) = self.lr {
            config.optimizer.learning_rate = lr;
        }
        if let Some(patience) = self.patience {
            config.runtime.patience = patience;
        }
        if let Some(steps) = self.num_warmup_steps {
            config.scheduler.warmup_steps = steps;
        }
        if self.local_rank.is_some() {
            config.runtime.local_rank = self.local_rank;
        }
        if !self.folds.is_empty() {
            config.runtime.folds = self.folds.clone();
        }
    }
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    args.apply_to(&mut config);
    config.validate()?;

    let context = DistributedContext::from_env(&config.runtime)?;
    if let Err(err) = context.device().set_seed(config.runtime.seed) {
        eprintln!("warning: failed to seed device RNG: {}", err);
    }
    let mut logger = Logger::new(LoggingSettings::from_config(
        &config.runtime.logging,
        context.is_primary(),
    ))?;

    let encoder = SpanEncoder::from_config(&config.tokenizer, config.data.max_len)?;
    let encoder_config = config.model.to_encoder_config(encoder.vocab_size());
    let mut factory = EncoderFactory::new(encoder_config);
    if let Some(path) = &config.model.pretrained_weights {
        factory = factory.with_pretrained(path.clone());
    }

    let outcomes = run_training(&config, &context, &encoder, &factory, &mut logger)?;
    for outcome in &outcomes {
        logger.log_message(&format!(
            "fold {}: best jaccard {} after {} epoch(s){} -> {}",
            outcome.fold,
            outcome
                .best_score
                .map(|score| format!("{:.6}", score))
                .unwrap_or_else(|| "n/a".to_string()),
            outcome.epochs_run(),
            if outcome.stopped_early { " (early stop)" } else { "" },
            outcome.checkpoint.display()
        ));
    }

    Ok(())
}

/// Applies `key=value` overrides through the config's JSON form.
fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config)?;
    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }
    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("failed to deserialize config after overrides: {err}"))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Sets `path` (dot-separated object keys) inside `root`, creating missing objects.
fn set_value_at_path(root: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let keys: Vec<&str> = path.split('.').map(str::trim).collect();
    if keys.iter().any(|key| key.is_empty()) {
        return Err(TrainingError::ConfigFormat(format!(
            "invalid override path '{}'",
            path
        )));
    }

    let mut current = root;
    for (depth, key) in keys.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().ok_or_else(|| {
            TrainingError::ConfigFormat(format!(
                "override path '{}' crosses a non-object value before '{}'",
                path, key
            ))
        })?;
        let entry = map.entry(key.to_string()).or_insert(Value::Null);
        if depth + 1 == keys.len() {
            *entry = new_value;
            return Ok(());
        }
        current = entry;
    }
    Ok(())
}
