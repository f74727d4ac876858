use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use prost::Message;

use crate::{config::LoggingConfig, metrics::EpochSummary, TrainingError};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub progress_bar: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    /// Settings for this process. Only the primary process prints or writes events.
    pub fn from_config(config: &LoggingConfig, primary: bool) -> Self {
        Self {
            enable_stdout: config.enable_stdout && primary,
            progress_bar: config.progress_bar && primary,
            tensorboard_dir: config.tensorboard_dir.clone().filter(|_| primary),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }

    pub fn silent() -> Self {
        Self {
            enable_stdout: false,
            progress_bar: false,
            tensorboard_dir: None,
            tensorboard_flush_every_n: 1,
        }
    }
}

/// Which loop an epoch summary came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Valid,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Valid => "valid",
        }
    }
}

pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
    lr_step: i64,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
            lr_step: 0,
        })
    }

    pub fn silent() -> Self {
        Self {
            settings: LoggingSettings::silent(),
            tensorboard: None,
            lr_step: 0,
        }
    }

    /// Per-batch bar showing the running loss and score; hidden when disabled.
    pub fn progress_bar(&self, batches: usize, phase: Phase, fold: usize, epoch: usize) -> ProgressBar {
        if !self.settings.progress_bar {
            return ProgressBar::with_draw_target(Some(batches as u64), ProgressDrawTarget::hidden());
        }
        let bar = ProgressBar::new(batches as u64);
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
        bar.set_style(style);
        bar.set_prefix(format!("fold {} epoch {} {}", fold, epoch, phase.as_str()));
        bar
    }

    pub fn log_learning_rate(&mut self, lr: f64) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.write_scalar("train/learning_rate", self.lr_step, lr);
        }
        self.lr_step += 1;
    }

    pub fn log_epoch(&mut self, fold: usize, epoch: usize, phase: Phase, summary: &EpochSummary) {
        if self.settings.enable_stdout {
            println!(
                "fold={} epoch={} {} loss={:.4} jaccard={:.4} samples={} batches={}",
                fold,
                epoch,
                phase.as_str(),
                summary.loss,
                summary.score,
                summary.samples,
                summary.batches
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = epoch as i64;
            let prefix = format!("fold_{}/{}", fold, phase.as_str());
            let _ = writer.write_scalar(&format!("{}/loss", prefix), step, summary.loss);
            let _ = writer.write_scalar(&format!("{}/jaccard", prefix), step, summary.score);
        }
    }

    /// Final validation score of an epoch, after reduction across processes.
    pub fn log_validation_score(&mut self, fold: usize, epoch: usize, score: f64, improved: bool) {
        if self.settings.enable_stdout {
            if improved {
                println!("fold={} epoch={} jaccard score = {:.6} (new best)", fold, epoch, score);
            } else {
                println!("fold={} epoch={} jaccard score = {:.6}", fold, epoch, score);
            }
        }
    }

    pub fn log_message(&self, message: &str) {
        if self.settings.enable_stdout {
            println!("{}", message);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    /// TFRecord framing: length, masked CRC of the length, payload, masked CRC of
    /// the payload.
    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
