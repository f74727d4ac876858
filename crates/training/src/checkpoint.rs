use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use span_model::SpanModel;

use crate::TrainingError;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Sidecar written next to every fold snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub fold: usize,
    pub epoch: usize,
    pub score: f64,
    pub model: FileRecord,
}

/// Something the early-stopping controller can persist when a score improves.
pub trait ModelSnapshot {
    fn persist(&self, path: &Path, score: f64) -> Result<(), TrainingError>;
}

/// Snapshot of a fold's model at a given epoch. Non-primary processes skip the write.
pub struct FoldSnapshot<'a, M: SpanModel> {
    model: &'a M,
    fold: usize,
    epoch: usize,
    primary: bool,
}

impl<'a, M: SpanModel> FoldSnapshot<'a, M> {
    pub fn new(model: &'a M, fold: usize, epoch: usize, primary: bool) -> Self {
        Self {
            model,
            fold,
            epoch,
            primary,
        }
    }
}

impl<M: SpanModel> ModelSnapshot for FoldSnapshot<'_, M> {
    fn persist(&self, path: &Path, score: f64) -> Result<(), TrainingError> {
        if !self.primary {
            return Ok(());
        }
        write_snapshot(self.model, path, self.fold, self.epoch, score)?;
        Ok(())
    }
}

/// `<dir>/model_<fold>.safetensors`
pub fn checkpoint_path(directory: &Path, fold: usize) -> PathBuf {
    directory.join(format!("model_{}.safetensors", fold))
}

pub fn manifest_path(weights_path: &Path) -> PathBuf {
    weights_path.with_extension("json")
}

/// Writes the model's weights to `path`, replacing any earlier snapshot, and the
/// JSON manifest beside it.
pub fn write_snapshot<M: SpanModel + ?Sized>(
    model: &M,
    path: &Path,
    fold: usize,
    epoch: usize,
    score: f64,
) -> Result<CheckpointManifest, TrainingError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                parent.display()
            ))
        })?;
    }

    save_model_weights(model, path)?;
    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        fold,
        epoch,
        score,
        model: file_record(path)?,
    };
    write_json(&manifest_path(path), &manifest)?;
    Ok(manifest)
}

pub fn save_model_weights<M: SpanModel + ?Sized>(
    model: &M,
    path: &Path,
) -> Result<(), TrainingError> {
    let named_parameters = model.named_parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, _> = named_parameters
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

/// Loads a snapshot into `model`. Every parameter must be present with its exact
/// shape, and no extra tensors may remain. The manifest checksum is verified when
/// the manifest exists.
pub fn restore_model_weights<M: SpanModel + ?Sized>(
    model: &M,
    path: &Path,
) -> Result<Option<CheckpointManifest>, TrainingError> {
    let manifest_file = manifest_path(path);
    let manifest = if manifest_file.is_file() {
        let manifest: CheckpointManifest = read_json(&manifest_file)?;
        ensure_version_supported(manifest.version)?;
        validate_file(path, &manifest.model.sha256)?;
        Some(manifest)
    } else {
        None
    };

    let mut tensors: HashMap<String, _> = load_safetensors(path, model.device())?;
    for (name, var) in model.named_parameters() {
        let tensor = tensors.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype)?
        };
        var.set(&tensor)?;
    }

    if !tensors.is_empty() {
        let mut extra: Vec<_> = tensors.into_keys().collect();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(manifest)
}

pub fn read_manifest(weights_path: &Path) -> Result<CheckpointManifest, TrainingError> {
    let path = manifest_path(weights_path);
    if !path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            path.display()
        )));
    }
    read_json(&path)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
