use std::{
    collections::BTreeMap,
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    thread::JoinHandle,
};

use candle_core::{Device, Tensor};

pub mod dataset;
pub mod encoding;
pub mod sampler;

pub use dataset::{fold_ids, load_rows, partition_fold, EncodedSample, SpanDataset, SpanRow};
pub use encoding::{normalize_whitespace, SpanEncoder, SpecialTokens, PREFIX_TOKENS};
pub use sampler::{DistributedSampler, RandomSampler, Sampler, SequentialSampler};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Device-resident model inputs plus the host-side text needed for scoring.
#[derive(Debug)]
pub struct SpanBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub token_type_ids: Tensor,
    pub start_positions: Tensor,
    pub end_positions: Tensor,
    pub texts: Vec<String>,
    pub targets: Vec<String>,
    pub offsets: Vec<Vec<(usize, usize)>>,
}

impl SpanBatch {
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

/// Collated batch that has not been moved to a device yet. Built on worker threads.
#[derive(Debug, Clone)]
pub struct HostBatch {
    rows: usize,
    seq_len: usize,
    input_ids: Vec<u32>,
    attention_mask: Vec<u32>,
    token_type_ids: Vec<u32>,
    start_positions: Vec<u32>,
    end_positions: Vec<u32>,
    texts: Vec<String>,
    targets: Vec<String>,
    offsets: Vec<Vec<(usize, usize)>>,
}

impl HostBatch {
    pub fn collate(dataset: &SpanDataset, indices: &[usize]) -> Result<Self> {
        let seq_len = dataset.seq_len();
        let mut batch = HostBatch {
            rows: indices.len(),
            seq_len,
            input_ids: Vec::with_capacity(indices.len() * seq_len),
            attention_mask: Vec::with_capacity(indices.len() * seq_len),
            token_type_ids: Vec::with_capacity(indices.len() * seq_len),
            start_positions: Vec::with_capacity(indices.len()),
            end_positions: Vec::with_capacity(indices.len()),
            texts: Vec::with_capacity(indices.len()),
            targets: Vec::with_capacity(indices.len()),
            offsets: Vec::with_capacity(indices.len()),
        };
        for &index in indices {
            let sample = dataset.get(index).ok_or_else(|| {
                TrainingError::data(format!(
                    "sample index {} out of range for dataset of {}",
                    index,
                    dataset.len()
                ))
            })?;
            batch.input_ids.extend_from_slice(&sample.input_ids);
            batch.attention_mask.extend_from_slice(&sample.attention_mask);
            batch.token_type_ids.extend_from_slice(&sample.token_type_ids);
            batch.start_positions.push(sample.start_position);
            batch.end_positions.push(sample.end_position);
            batch.texts.push(sample.text.clone());
            batch.targets.push(sample.target.clone());
            batch.offsets.push(sample.offsets.clone());
        }
        Ok(batch)
    }

    pub fn to_device(self, device: &Device) -> Result<SpanBatch> {
        let shape = (self.rows, self.seq_len);
        Ok(SpanBatch {
            input_ids: Tensor::from_vec(self.input_ids, shape, device)?,
            attention_mask: Tensor::from_vec(self.attention_mask, shape, device)?,
            token_type_ids: Tensor::from_vec(self.token_type_ids, shape, device)?,
            start_positions: Tensor::from_vec(self.start_positions, self.rows, device)?,
            end_positions: Tensor::from_vec(self.end_positions, self.rows, device)?,
            texts: self.texts,
            targets: self.targets,
            offsets: self.offsets,
        })
    }
}

/// Batches a dataset in sampler order. The final partial batch is kept.
pub struct SpanDataLoader {
    dataset: Arc<SpanDataset>,
    sampler: Box<dyn Sampler>,
    batch_size: usize,
    num_workers: usize,
    device: Device,
}

impl SpanDataLoader {
    pub fn new(
        dataset: Arc<SpanDataset>,
        sampler: Box<dyn Sampler>,
        batch_size: usize,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        Ok(Self {
            dataset,
            sampler,
            batch_size,
            num_workers: 0,
            device,
        })
    }

    /// Collates on `num_workers` background threads; 0 collates on the caller.
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
    }

    pub fn num_batches(&self) -> usize {
        self.sampler.len().div_ceil(self.batch_size)
    }

    pub fn iter(&self) -> BatchIter {
        let chunks: Vec<Vec<usize>> = self
            .sampler
            .indices()
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();

        let source = if self.num_workers == 0 || chunks.len() < 2 {
            BatchSource::Inline {
                dataset: Arc::clone(&self.dataset),
                chunks: chunks.into_iter(),
            }
        } else {
            BatchSource::Prefetch(Prefetcher::spawn(
                Arc::clone(&self.dataset),
                chunks,
                self.num_workers,
            ))
        };

        BatchIter {
            source,
            device: self.device.clone(),
        }
    }
}

pub struct BatchIter {
    source: BatchSource,
    device: Device,
}

enum BatchSource {
    Inline {
        dataset: Arc<SpanDataset>,
        chunks: std::vec::IntoIter<Vec<usize>>,
    },
    Prefetch(Prefetcher),
}

impl Iterator for BatchIter {
    type Item = Result<SpanBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let host = match &mut self.source {
            BatchSource::Inline { dataset, chunks } => {
                let indices = chunks.next()?;
                HostBatch::collate(dataset, &indices)
            }
            BatchSource::Prefetch(prefetcher) => prefetcher.next()?,
        };
        Some(host.and_then(|batch| batch.to_device(&self.device)))
    }
}

/// Worker threads collating host batches ahead of the consumer. Worker `w` handles
/// batches `w, w + workers, ...`; the consumer restores loader order.
struct Prefetcher {
    receiver: Option<Receiver<(usize, Result<HostBatch>)>>,
    workers: Vec<JoinHandle<()>>,
    pending: BTreeMap<usize, Result<HostBatch>>,
    next_index: usize,
    total: usize,
}

impl Prefetcher {
    fn spawn(dataset: Arc<SpanDataset>, chunks: Vec<Vec<usize>>, num_workers: usize) -> Self {
        let total = chunks.len();
        let num_workers = num_workers.min(total).max(1);
        let (sender, receiver) = mpsc::sync_channel(num_workers * 2);
        let chunks = Arc::new(chunks);

        let workers = (0..num_workers)
            .map(|worker| {
                let sender = sender.clone();
                let dataset = Arc::clone(&dataset);
                let chunks = Arc::clone(&chunks);
                std::thread::spawn(move || {
                    for index in (worker..chunks.len()).step_by(num_workers) {
                        let batch = HostBatch::collate(&dataset, &chunks[index]);
                        if sender.send((index, batch)).is_err() {
                            return;
                        }
                    }
                })
            })
            .collect();

        Self {
            receiver: Some(receiver),
            workers,
            pending: BTreeMap::new(),
            next_index: 0,
            total,
        }
    }

    fn next(&mut self) -> Option<Result<HostBatch>> {
        if self.next_index >= self.total {
            return None;
        }
        loop {
            if let Some(batch) = self.pending.remove(&self.next_index) {
                self.next_index += 1;
                return Some(batch);
            }
            let received = self.receiver.as_ref()?.recv();
            match received {
                Ok((index, batch)) => {
                    self.pending.insert(index, batch);
                }
                Err(_) => {
                    self.next_index = self.total;
                    return Some(Err(TrainingError::data(
                        "data loader worker exited before producing every batch",
                    )));
                }
            }
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // Dropping the receiver unblocks workers waiting on a full channel.
        self.receiver.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
