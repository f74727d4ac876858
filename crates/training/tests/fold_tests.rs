use std::{
    collections::HashMap,
    fs,
    net::TcpListener,
    path::Path,
    sync::Arc,
    thread,
};

use candle_core::{DType, Device, Tensor, Var};
use span_model::{ModelFactory, SpanLogits, SpanModel};
use span_training::{
    checkpoint::{checkpoint_path, read_manifest},
    config::LrScaling,
    data::{EncodedSample, SequentialSampler},
    distributed::{LocalGroup, ProcessGroup, TcpProcessGroup},
    restore_model_weights, run_epoch, run_training, train_fold, DistributedContext, EpochLabel,
    EpochMode, Logger, SpanDataLoader, SpanDataset, SpanEncoder, TrainingConfig,
};
use tempfile::tempdir;
use tokenizers::{models::wordlevel::WordLevel, pre_tokenizers::whitespace::Whitespace, Tokenizer};

const SEQ_LEN: usize = 8;
const KEY_POSITION: usize = 4;
const PEAK: f32 = 2.0;

/// Fixed logits chosen by the first text token: one `PEAK` at the mapped start and
/// end positions, zeros elsewhere. A single bias takes part through a product with
/// zeros so the optimizer sees a gradient that never changes the logits.
struct StubModel {
    peaks: HashMap<u32, (usize, usize)>,
    bias: Var,
    device: Device,
}

impl SpanModel for StubModel {
    fn forward(
        &self,
        input_ids: &Tensor,
        _attention_mask: &Tensor,
        _token_type_ids: &Tensor,
    ) -> candle_core::Result<SpanLogits> {
        let (batch, seq) = input_ids.dims2()?;
        let rows = input_ids.to_vec2::<u32>()?;
        let mut start = vec![0f32; batch * seq];
        let mut end = vec![0f32; batch * seq];
        for (row, tokens) in rows.iter().enumerate() {
            let key = tokens.get(KEY_POSITION).copied().unwrap_or(0);
            let (s, e) = self
                .peaks
                .get(&key)
                .copied()
                .unwrap_or((KEY_POSITION, KEY_POSITION));
            start[row * seq + s.min(seq - 1)] = PEAK;
            end[row * seq + e.min(seq - 1)] = PEAK;
        }
        let device = input_ids.device();
        let zeros = Tensor::zeros((batch, seq), DType::F32, device)?;
        let tied = self.bias.as_tensor().to_device(device)?.broadcast_mul(&zeros)?;
        Ok(SpanLogits {
            start: (Tensor::from_vec(start, (batch, seq), device)? + &tied)?,
            end: (Tensor::from_vec(end, (batch, seq), device)? + &tied)?,
        })
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![("qa_outputs.bias".to_string(), self.bias.clone())]
    }

    fn set_training(&self, _training: bool) {}

    fn device(&self) -> &Device {
        &self.device
    }
}

#[derive(Clone, Default)]
struct StubFactory {
    peaks: HashMap<u32, (usize, usize)>,
}

impl ModelFactory for StubFactory {
    type Model = StubModel;

    fn build(&self, device: &Device) -> candle_core::Result<StubModel> {
        Ok(StubModel {
            peaks: self.peaks.clone(),
            bias: Var::new(&[0.5f32], device)?,
            device: device.clone(),
        })
    }
}

fn sample(key: u32, text: &str, target: &str, start: u32, end: u32) -> EncodedSample {
    EncodedSample {
        input_ids: vec![0, 5, 2, 2, key, 9, 2, 1],
        attention_mask: vec![1, 1, 1, 1, 1, 1, 1, 0],
        token_type_ids: vec![0; SEQ_LEN],
        start_position: start,
        end_position: end,
        offsets: vec![(0, 0), (0, 0), (0, 0), (0, 0), (0, 3), (3, 7), (0, 0), (0, 0)],
        text: text.to_string(),
        target: target.to_string(),
        sentiment: "neutral".to_string(),
    }
}

/// Every training sample is predicted exactly.
fn train_set() -> SpanDataset {
    SpanDataset::from_samples(vec![
        sample(10, " my day", " day", 5, 5),
        sample(11, " so fun", " so", 4, 4),
        sample(12, " we won", " we won", 4, 5),
        sample(13, " oh no", " no", 5, 5),
    ])
    .unwrap()
}

/// First sample predicted exactly, second predicted as " way" against " no way".
fn valid_set() -> SpanDataset {
    SpanDataset::from_samples(vec![
        sample(20, " my day", " day", 5, 5),
        sample(21, " no way", " no way", 4, 5),
    ])
    .unwrap()
}

fn factory() -> StubFactory {
    let peaks = [
        (10, (5, 5)),
        (11, (4, 4)),
        (12, (4, 5)),
        (13, (5, 5)),
        (20, (5, 5)),
        (21, (5, 5)),
    ]
    .into_iter()
    .collect();
    StubFactory { peaks }
}

fn config(checkpoint_dir: &Path, epochs: usize, patience: usize) -> TrainingConfig {
    let mut config: TrainingConfig = toml::from_str(
        r#"
            [data]
            training_file = "train_folds.csv"
            train_batch_size = 3
            valid_batch_size = 2

            [tokenizer]
            tokenizer_json = "tokenizer.json"
        "#,
    )
    .unwrap();
    config.runtime.epochs = epochs;
    config.runtime.patience = patience;
    config.runtime.checkpoint_dir = checkpoint_dir.to_path_buf();
    config.scheduler.warmup_steps = 0;
    config.optimizer.learning_rate = 1e-3;
    config.optimizer.lr_scaling = LrScaling::None;
    config
}

/// `logsumexp` of a row with one `PEAK` among `SEQ_LEN` positions.
fn log_normalizer() -> f64 {
    ((PEAK as f64).exp() + (SEQ_LEN - 1) as f64).ln()
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-5,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn one_fold_one_epoch_reports_fixed_averages() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 1, 3);
    let context = DistributedContext::local();
    let mut logger = Logger::silent();

    let outcome = train_fold(
        0,
        train_set(),
        valid_set(),
        &factory(),
        &config,
        &context,
        &mut logger,
    )
    .unwrap();

    let l = log_normalizer();
    assert_eq!(outcome.epochs_run(), 1);
    let record = &outcome.history[0];
    assert_close(record.train.loss, 2.0 * (l - PEAK as f64));
    assert_close(record.train.score, 1.0);
    assert_eq!(record.train.samples, 4);
    assert_eq!(record.train.batches, 2);
    assert_close(record.valid.loss, 2.0 * l - 3.0);
    assert_close(record.valid.score, 0.75);
    assert_close(record.score, 0.75);
    assert!(record.improved);
    assert_eq!(outcome.best_score, Some(record.score));
    assert!(!outcome.stopped_early);

    assert_eq!(outcome.checkpoint, checkpoint_path(dir.path(), 0));
    let manifest = read_manifest(&outcome.checkpoint).unwrap();
    assert_eq!((manifest.fold, manifest.epoch), (0, 0));
    assert_close(manifest.score, 0.75);

    let fresh = factory().build(&Device::Cpu).unwrap();
    restore_model_weights(&fresh, &outcome.checkpoint).unwrap();
    let bias = fresh.bias.as_tensor().to_vec1::<f32>().unwrap();
    assert!((bias[0] - 0.5).abs() < 1e-6);
}

#[test]
fn plateau_stops_fold_and_keeps_first_checkpoint() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), 6, 2);
    let mut logger = Logger::silent();

    let outcome = train_fold(
        3,
        train_set(),
        valid_set(),
        &factory(),
        &config,
        &DistributedContext::local(),
        &mut logger,
    )
    .unwrap();

    assert!(outcome.stopped_early);
    assert_eq!(outcome.epochs_run(), 3);
    let improved: Vec<bool> = outcome.history.iter().map(|r| r.improved).collect();
    assert_eq!(improved, vec![true, false, false]);
    assert_eq!(read_manifest(&checkpoint_path(dir.path(), 3)).unwrap().epoch, 0);
}

#[test]
fn eval_epoch_visits_every_batch_once() {
    let model = span_training::ParallelModel::single(factory().build(&Device::Cpu).unwrap());
    let loader = SpanDataLoader::new(
        Arc::new(valid_set()),
        Box::new(SequentialSampler::new(2)),
        1,
        Device::Cpu,
    )
    .unwrap();
    let mut logger = Logger::silent();

    let summary = run_epoch(
        &model,
        &loader,
        EpochMode::Eval,
        &mut logger,
        EpochLabel { fold: 0, epoch: 0 },
    )
    .unwrap();

    assert_eq!(summary.batches, 2);
    assert_eq!(summary.samples, 2);
    assert_close(summary.score, 0.75);
    assert_close(summary.loss, 2.0 * log_normalizer() - 3.0);
}

#[test]
fn data_parallel_and_local_group_match_single_device() {
    let dir = tempdir().unwrap();
    let single = train_fold(
        0,
        train_set(),
        valid_set(),
        &factory(),
        &config(&dir.path().join("single"), 1, 3),
        &DistributedContext::local(),
        &mut Logger::silent(),
    )
    .unwrap();

    let replicated = train_fold(
        0,
        train_set(),
        valid_set(),
        &factory(),
        &config(&dir.path().join("replicated"), 1, 3),
        &DistributedContext::data_parallel(Device::Cpu, vec![Device::Cpu]),
        &mut Logger::silent(),
    )
    .unwrap();

    let grouped = train_fold(
        0,
        train_set(),
        valid_set(),
        &factory(),
        &config(&dir.path().join("grouped"), 1, 3),
        &DistributedContext::distributed(Arc::new(LocalGroup), Device::Cpu),
        &mut Logger::silent(),
    )
    .unwrap();

    for other in [&replicated, &grouped] {
        assert_close(other.history[0].valid.loss, single.history[0].valid.loss);
        assert_close(other.history[0].score, single.history[0].score);
        assert_close(other.history[0].train.loss, single.history[0].train.loss);
    }
}

#[test]
fn two_process_fold_agrees_on_score_and_only_rank_zero_writes() {
    let dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let rank_one_dir = dir.path().join("rank1");
    let peer = {
        let rank_one_dir = rank_one_dir.clone();
        thread::spawn(move || {
            let group: Arc<dyn ProcessGroup> = Arc::new(TcpProcessGroup::join(addr, 1, 2).unwrap());
            let context = DistributedContext::distributed(group, Device::Cpu);
            assert!(!context.is_primary());
            train_fold(
                0,
                train_set(),
                valid_set(),
                &factory(),
                &config(&rank_one_dir, 2, 3),
                &context,
                &mut Logger::silent(),
            )
            .unwrap()
        })
    };

    let rank_zero_dir = dir.path().join("rank0");
    let group: Arc<dyn ProcessGroup> = Arc::new(TcpProcessGroup::host(listener, 2).unwrap());
    let context = DistributedContext::distributed(group, Device::Cpu);
    let primary = train_fold(
        0,
        train_set(),
        valid_set(),
        &factory(),
        &config(&rank_zero_dir, 2, 3),
        &context,
        &mut Logger::silent(),
    )
    .unwrap();
    let secondary = peer.join().unwrap();

    // each rank validates one sample: 1.0 and 0.5
    let primary_scores: Vec<f64> = primary.history.iter().map(|r| r.score).collect();
    let secondary_scores: Vec<f64> = secondary.history.iter().map(|r| r.score).collect();
    assert_eq!(primary_scores, secondary_scores);
    for score in primary_scores {
        assert_close(score, 0.75);
    }
    assert_eq!(primary.history[0].valid.samples, 1);
    assert_eq!(primary.history[0].train.samples, 2);

    assert!(checkpoint_path(&rank_zero_dir, 0).exists());
    assert!(!checkpoint_path(&rank_one_dir, 0).exists());
}

fn word_level_encoder(max_len: usize) -> SpanEncoder {
    let words = [
        "<s>", "<pad>", "</s>", "<unk>", "positive", "negative", "neutral", "my", "day", "was",
        "great", "not", "bad",
    ];
    let vocab: HashMap<String, u32> = words
        .iter()
        .enumerate()
        .map(|(id, word)| (word.to_string(), id as u32))
        .collect();
    let model = WordLevel::builder()
        .vocab(vocab.into_iter().collect())
        .unk_token("<unk>".to_string())
        .build()
        .unwrap();
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(Whitespace {}));
    SpanEncoder::new(tokenizer, max_len).unwrap()
}

#[test]
fn run_training_covers_requested_folds_from_csv() {
    let dir = tempdir().unwrap();
    let csv_path = dir.path().join("train_folds.csv");
    fs::write(
        &csv_path,
        "textID,text,selected_text,sentiment,kfold\n\
         a,my day was great,great,positive,0\n\
         b,not bad,not bad,negative,0\n\
         c,my day,day,neutral,1\n\
         d,was great,was great,positive,1\n",
    )
    .unwrap();

    let mut config = config(&dir.path().join("bin"), 1, 3);
    config.data.training_file = csv_path.clone();
    config.runtime.folds = vec![0, 1];
    let encoder = word_level_encoder(10);

    let outcomes = run_training(
        &config,
        &DistributedContext::local(),
        &encoder,
        &StubFactory::default(),
        &mut Logger::silent(),
    )
    .unwrap();

    assert_eq!(outcomes.len(), 2);
    for (fold, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.fold, fold);
        assert_eq!(outcome.epochs_run(), 1);
        assert!(outcome.checkpoint.exists());
    }

    config.runtime.folds = vec![4];
    assert!(run_training(
        &config,
        &DistributedContext::local(),
        &encoder,
        &StubFactory::default(),
        &mut Logger::silent(),
    )
    .is_err());
}
