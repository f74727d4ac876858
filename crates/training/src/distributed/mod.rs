use std::sync::Arc;

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use span_model::ModelFactory;

pub mod group;
pub mod parallel;

pub use group::{LocalGroup, ProcessGroup, TcpProcessGroup};
pub use parallel::ParallelModel;

use crate::{
    config::{ParallelPreference, RuntimeConfig},
    data::{DistributedSampler, RandomSampler, Sampler, SequentialSampler},
    TrainingError,
};

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;
const MAX_PROBED_DEVICES: usize = 16;

/// Execution layout of a run. Exactly one applies per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelMode {
    SingleDevice,
    DataParallel,
    Distributed,
}

/// Resolved layout with the resources each mode needs.
pub enum ParallelStrategy {
    SingleDevice,
    /// One process driving the primary device plus `replica_devices`.
    DataParallel { replica_devices: Vec<Device> },
    Distributed { group: Arc<dyn ProcessGroup> },
}

impl ParallelStrategy {
    pub fn mode(&self) -> ParallelMode {
        match self {
            ParallelStrategy::SingleDevice => ParallelMode::SingleDevice,
            ParallelStrategy::DataParallel { .. } => ParallelMode::DataParallel,
            ParallelStrategy::Distributed { .. } => ParallelMode::Distributed,
        }
    }

    /// Devices contributing gradients to one optimizer step.
    pub fn device_count(&self) -> usize {
        match self {
            ParallelStrategy::SingleDevice => 1,
            ParallelStrategy::DataParallel { replica_devices } => 1 + replica_devices.len(),
            ParallelStrategy::Distributed { group } => group.world_size(),
        }
    }

    /// Prepares `model` for this layout. Data-parallel replicas are built with
    /// `factory` and start from the model's weights.
    pub fn wrap<F: ModelFactory>(
        &self,
        model: F::Model,
        factory: &F,
    ) -> Result<ParallelModel<F::Model>, TrainingError> {
        match self {
            ParallelStrategy::SingleDevice => Ok(ParallelModel::single(model)),
            ParallelStrategy::DataParallel { replica_devices } => {
                let replicas = replica_devices
                    .iter()
                    .map(|device| factory.build(device))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                ParallelModel::data_parallel(model, replicas)
            }
            ParallelStrategy::Distributed { group } => {
                ParallelModel::distributed(model, Arc::clone(group))
            }
        }
    }

    /// Sampler over a dataset of `len` samples; distributed runs see their rank's shard.
    pub fn shard(&self, len: usize, shuffle: bool, seed: u64) -> Box<dyn Sampler> {
        match self {
            ParallelStrategy::Distributed { group } => Box::new(DistributedSampler::new(
                len,
                group.world_size(),
                group.rank(),
                shuffle,
                seed,
            )),
            _ if shuffle => Box::new(RandomSampler::new(len, seed)),
            _ => Box::new(SequentialSampler::new(len)),
        }
    }
}

/// Process-wide execution context: the layout, this process's rank and its device.
///
/// Built once at program entry and passed by reference to the fold loop.
pub struct DistributedContext {
    strategy: ParallelStrategy,
    device: Device,
    rank: usize,
    world_size: usize,
}

impl DistributedContext {
    /// Single process on the CPU.
    pub fn local() -> Self {
        Self::single(Device::Cpu)
    }

    pub fn single(device: Device) -> Self {
        Self {
            strategy: ParallelStrategy::SingleDevice,
            device,
            rank: 0,
            world_size: 1,
        }
    }

    pub fn data_parallel(primary: Device, replica_devices: Vec<Device>) -> Self {
        Self {
            strategy: ParallelStrategy::DataParallel { replica_devices },
            device: primary,
            rank: 0,
            world_size: 1,
        }
    }

    pub fn distributed(group: Arc<dyn ProcessGroup>, device: Device) -> Self {
        let rank = group.rank();
        let world_size = group.world_size();
        Self {
            strategy: ParallelStrategy::Distributed { group },
            device,
            rank,
            world_size,
        }
    }

    /// Resolves the layout from the launcher environment and the runtime section.
    pub fn from_env(runtime: &RuntimeConfig) -> Result<Self, TrainingError> {
        let launch = LaunchEnv::from_lookup(|key| std::env::var(key).ok())?;
        Self::resolve(runtime, &launch)
    }

    fn resolve(runtime: &RuntimeConfig, launch: &LaunchEnv) -> Result<Self, TrainingError> {
        let local_rank = runtime
            .local_rank
            .or(launch.local_rank)
            .unwrap_or(launch.rank);
        let launched_distributed = launch.world_size > 1;

        let context = match runtime.parallel {
            ParallelPreference::Distributed => Self::join_group(launch, local_rank)?,
            ParallelPreference::Auto if launched_distributed => {
                Self::join_group(launch, local_rank)?
            }
            ParallelPreference::SingleDevice | ParallelPreference::DataParallel
                if launched_distributed =>
            {
                return Err(TrainingError::initialization(format!(
                    "parallel mode {:?} cannot run under a launcher with WORLD_SIZE={}",
                    runtime.parallel, launch.world_size
                )));
            }
            ParallelPreference::SingleDevice => Self::single(select_device(local_rank)),
            ParallelPreference::Auto | ParallelPreference::DataParallel => {
                let mut devices = if runtime.devices.is_empty() {
                    probe_cuda_devices()
                } else {
                    runtime
                        .devices
                        .iter()
                        .map(|&ordinal| Device::new_cuda(ordinal))
                        .collect::<candle_core::Result<Vec<_>>>()?
                };
                if devices.len() > 1 {
                    let primary = devices.remove(0);
                    Self::data_parallel(primary, devices)
                } else {
                    if runtime.parallel == ParallelPreference::DataParallel {
                        eprintln!(
                            "data parallel requested but {} accelerator(s) visible; using one device",
                            devices.len()
                        );
                    }
                    match devices.pop() {
                        Some(device) => Self::single(device),
                        None => Self::single(select_device(local_rank)),
                    }
                }
            }
        };

        if context.is_primary() {
            println!(
                "parallel mode={:?} devices={} world_size={} device={:?}",
                context.mode(),
                context.device_count(),
                context.world_size,
                context.device
            );
        }
        Ok(context)
    }

    fn join_group(launch: &LaunchEnv, local_rank: usize) -> Result<Self, TrainingError> {
        let group: Arc<dyn ProcessGroup> = if launch.world_size > 1 {
            Arc::new(TcpProcessGroup::init(
                &launch.master_addr,
                launch.master_port,
                launch.rank,
                launch.world_size,
            )?)
        } else {
            Arc::new(LocalGroup)
        };
        Ok(Self::distributed(group, select_device(local_rank)))
    }

    pub fn strategy(&self) -> &ParallelStrategy {
        &self.strategy
    }

    pub fn mode(&self) -> ParallelMode {
        self.strategy.mode()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Rank 0 reports progress and writes checkpoints.
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    pub fn device_count(&self) -> usize {
        self.strategy.device_count()
    }

    /// Mean of `value` across processes; the identity outside distributed runs.
    pub fn reduce_mean(&self, value: f64) -> Result<f64, TrainingError> {
        match &self.strategy {
            ParallelStrategy::Distributed { group } => {
                let mut buffer = [value as f32];
                group.all_reduce_mean(&mut buffer)?;
                Ok(buffer[0] as f64)
            }
            _ => Ok(value),
        }
    }

    pub fn barrier(&self) -> Result<(), TrainingError> {
        match &self.strategy {
            ParallelStrategy::Distributed { group } => group.barrier(),
            _ => Ok(()),
        }
    }
}

/// Launcher variables (`WORLD_SIZE`, `RANK`, `LOCAL_RANK`, `MASTER_ADDR`, `MASTER_PORT`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEnv {
    pub world_size: usize,
    pub rank: usize,
    pub local_rank: Option<usize>,
    pub master_addr: String,
    pub master_port: u16,
}

impl LaunchEnv {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TrainingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let world_size = parse_var(&lookup, "WORLD_SIZE")?.unwrap_or(1);
        let rank = parse_var(&lookup, "RANK")?.unwrap_or(0);
        if world_size == 0 || rank >= world_size {
            return Err(TrainingError::initialization(format!(
                "RANK={} is outside WORLD_SIZE={}",
                rank, world_size
            )));
        }
        Ok(Self {
            world_size,
            rank,
            local_rank: parse_var(&lookup, "LOCAL_RANK")?,
            master_addr: lookup("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string()),
            master_port: parse_var(&lookup, "MASTER_PORT")?.unwrap_or(DEFAULT_MASTER_PORT),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, TrainingError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            TrainingError::initialization(format!("{} must be an integer, got '{}'", key, raw))
        }),
    }
}

/// Metal or CUDA device `ordinal` when a backend is available, otherwise the CPU.
pub fn select_device(ordinal: usize) -> Device {
    if metal_is_available() {
        match Device::new_metal(ordinal) {
            Ok(device) => return device,
            Err(err) => eprintln!(
                "failed to initialize metal device #{}, falling back to CPU: {}",
                ordinal, err
            ),
        }
    } else if cuda_is_available() {
        match Device::new_cuda(ordinal) {
            Ok(device) => return device,
            Err(err) => eprintln!(
                "cuda reported available but device #{} failed to initialize: {}",
                ordinal, err
            ),
        }
    }
    Device::Cpu
}

fn probe_cuda_devices() -> Vec<Device> {
    if !cuda_is_available() {
        return Vec::new();
    }
    (0..MAX_PROBED_DEVICES)
        .map_while(|ordinal| Device::new_cuda(ordinal).ok())
        .collect()
}
