use std::{path::PathBuf, sync::Arc};

use span_model::{ModelFactory, SpanModel};

use crate::{
    checkpoint::{checkpoint_path, FoldSnapshot},
    data::{fold_ids, load_rows, partition_fold, SpanDataLoader, SpanDataset, SpanEncoder, SpanRow},
    distributed::DistributedContext,
    early_stopping::{EarlyStopping, Observation, StopMode},
    epoch::{run_epoch, EpochLabel, EpochMode},
    logging::Logger,
    metrics::EpochSummary,
    optimizer::{build_param_groups, AdamWConfig, TrainerOptimizer},
    scheduler::{total_training_steps, LinearWarmupDecay},
    TrainingConfig, TrainingError,
};

/// Summaries of one epoch. `score` is the validation score after averaging across
/// processes, the value fed to early stopping.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: EpochSummary,
    pub valid: EpochSummary,
    pub score: f64,
    pub improved: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FoldOutcome {
    pub fold: usize,
    pub best_score: Option<f64>,
    pub stopped_early: bool,
    pub checkpoint: PathBuf,
    pub history: Vec<EpochRecord>,
}

impl FoldOutcome {
    pub fn epochs_run(&self) -> usize {
        self.history.len()
    }
}

/// Trains every configured fold in turn and returns their outcomes.
pub fn run_training<F: ModelFactory>(
    config: &TrainingConfig,
    context: &DistributedContext,
    encoder: &SpanEncoder,
    factory: &F,
    logger: &mut Logger,
) -> Result<Vec<FoldOutcome>, TrainingError> {
    let rows = load_rows(&config.data.training_file)?;
    let available = fold_ids(&rows);
    logger.log_message(&format!(
        "loaded {} rows from {} (folds {:?})",
        rows.len(),
        config.data.training_file.display(),
        available
    ));

    let mut outcomes = Vec::with_capacity(config.runtime.folds.len());
    for &fold in &config.runtime.folds {
        if !available.contains(&fold) {
            return Err(TrainingError::data(format!(
                "fold {} has no rows in {}",
                fold,
                config.data.training_file.display()
            )));
        }
        outcomes.push(run_fold(fold, &rows, encoder, factory, config, context, logger)?);
    }

    let best: Vec<f64> = outcomes.iter().filter_map(|o| o.best_score).collect();
    if !best.is_empty() {
        logger.log_message(&format!(
            "cross-validation jaccard = {:.6} over {} fold(s)",
            best.iter().sum::<f64>() / best.len() as f64,
            best.len()
        ));
    }
    logger.flush();
    Ok(outcomes)
}

/// Splits `rows` on the fold column, encodes both halves and trains the fold.
pub fn run_fold<F: ModelFactory>(
    fold: usize,
    rows: &[SpanRow],
    encoder: &SpanEncoder,
    factory: &F,
    config: &TrainingConfig,
    context: &DistributedContext,
    logger: &mut Logger,
) -> Result<FoldOutcome, TrainingError> {
    let (train_rows, valid_rows) = partition_fold(rows, fold);
    let train = encoder.encode_rows(&train_rows)?;
    let valid = encoder.encode_rows(&valid_rows)?;
    train_fold(fold, train, valid, factory, config, context, logger)
}

/// Builds loaders, a fresh model, optimizer and schedule for one fold and runs the
/// epoch loop under early stopping. Everything built here is dropped on return.
pub fn train_fold<F: ModelFactory>(
    fold: usize,
    train: SpanDataset,
    valid: SpanDataset,
    factory: &F,
    config: &TrainingConfig,
    context: &DistributedContext,
    logger: &mut Logger,
) -> Result<FoldOutcome, TrainingError> {
    if train.is_empty() || valid.is_empty() {
        return Err(TrainingError::data(format!(
            "fold {} needs training and validation samples (got {} and {})",
            fold,
            train.len(),
            valid.len()
        )));
    }
    let runtime = &config.runtime;
    let strategy = context.strategy();
    let train_len = train.len();

    let mut train_loader = SpanDataLoader::new(
        Arc::new(train),
        strategy.shard(train_len, true, runtime.seed),
        config.data.train_batch_size,
        context.device().clone(),
    )?
    .with_workers(config.data.num_workers);
    let valid_len = valid.len();
    let mut valid_loader = SpanDataLoader::new(
        Arc::new(valid),
        strategy.shard(valid_len, false, runtime.seed),
        config.data.valid_batch_size,
        context.device().clone(),
    )?
    .with_workers(config.data.num_workers);

    let model = factory.build(context.device())?;
    let model = strategy.wrap(model, factory)?;

    let groups = build_param_groups(
        model.named_parameters(),
        &config.optimizer.no_decay,
        config.optimizer.weight_decay,
    );
    let learning_rate = config
        .optimizer
        .lr_scaling
        .apply(config.optimizer.learning_rate, context.device_count());
    let mut optimizer = TrainerOptimizer::new(
        groups,
        AdamWConfig::from_config(&config.optimizer, learning_rate),
    )?;
    let total_steps = total_training_steps(train_len, config.data.train_batch_size, runtime.epochs);
    let mut scheduler = LinearWarmupDecay::from_config(&config.scheduler, learning_rate, total_steps)?;

    logger.log_message(&format!(
        "fold {}: {} train / {} valid samples, lr={:.3e}, {} scheduled steps",
        fold, train_len, valid_len, learning_rate, total_steps
    ));

    let mut stopper = EarlyStopping::new(runtime.patience, StopMode::Max)
        .with_min_delta(runtime.min_delta);
    let checkpoint = checkpoint_path(&runtime.checkpoint_dir, fold);
    let mut history = Vec::with_capacity(runtime.epochs);

    for epoch in 0..runtime.epochs {
        train_loader.set_epoch(epoch);
        valid_loader.set_epoch(epoch);
        let label = EpochLabel { fold, epoch };

        let train_summary = run_epoch(
            &model,
            &train_loader,
            EpochMode::Train {
                optimizer: &mut optimizer,
                scheduler: &mut scheduler,
            },
            logger,
            label,
        )?;
        let valid_summary = run_epoch(&model, &valid_loader, EpochMode::Eval, logger, label)?;

        let score = context.reduce_mean(valid_summary.score)?;
        let snapshot = FoldSnapshot::new(&model, fold, epoch, context.is_primary());
        let observation = stopper.observe(score, &snapshot, &checkpoint)?;
        let improved = observation == Observation::Improved;
        logger.log_validation_score(fold, epoch, score, improved);

        history.push(EpochRecord {
            epoch,
            train: train_summary,
            valid: valid_summary,
            score,
            improved,
        });

        if stopper.should_stop() {
            logger.log_message(&format!("fold {}: early stopping after epoch {}", fold, epoch));
            break;
        }
    }

    Ok(FoldOutcome {
        fold,
        best_score: stopper.best(),
        stopped_early: stopper.should_stop(),
        checkpoint,
        history,
    })
}
