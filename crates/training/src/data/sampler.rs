use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Produces the order in which dataset indices are visited during one epoch.
pub trait Sampler: Send {
    fn indices(&self) -> Vec<usize>;

    /// Number of indices yielded per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-seeds epoch-dependent ordering. Order-independent samplers ignore it.
    fn set_epoch(&mut self, _epoch: usize) {}
}

#[derive(Debug, Clone)]
pub struct SequentialSampler {
    len: usize,
}

impl SequentialSampler {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl Sampler for SequentialSampler {
    fn indices(&self) -> Vec<usize> {
        (0..self.len).collect()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Full permutation per epoch, seeded with `seed + epoch`.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    len: usize,
    seed: u64,
    epoch: usize,
}

impl RandomSampler {
    pub fn new(len: usize, seed: u64) -> Self {
        Self { len, seed, epoch: 0 }
    }
}

impl Sampler for RandomSampler {
    fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.len).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
        indices.shuffle(&mut rng);
        indices
    }

    fn len(&self) -> usize {
        self.len
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}

/// Disjoint per-rank shard of the dataset.
///
/// The (optionally shuffled) index list is padded by wrapping around to a multiple
/// of `num_replicas` so every rank sees the same number of samples, then rank `r`
/// takes positions `r, r + num_replicas, ...`. Every rank must use the same seed and
/// epoch for the shards to be disjoint.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
}

impl DistributedSampler {
    pub fn new(len: usize, num_replicas: usize, rank: usize, shuffle: bool, seed: u64) -> Self {
        let num_replicas = num_replicas.max(1);
        Self {
            len,
            num_replicas,
            rank: rank.min(num_replicas - 1),
            shuffle,
            seed,
            epoch: 0,
        }
    }

    fn samples_per_replica(&self) -> usize {
        self.len.div_ceil(self.num_replicas)
    }
}

impl Sampler for DistributedSampler {
    fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }
        let mut indices: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            indices.shuffle(&mut rng);
        }

        let total = self.samples_per_replica() * self.num_replicas;
        let padded: Vec<usize> = indices.iter().copied().cycle().take(total).collect();

        padded
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }

    fn len(&self) -> usize {
        self.samples_per_replica()
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn sequential_visits_in_order() {
        assert_eq!(SequentialSampler::new(4).indices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn random_sampler_is_a_permutation_that_changes_with_epoch() {
        let mut sampler = RandomSampler::new(32, 7);
        let first = sampler.indices();
        assert_eq!(first, sampler.indices());
        sampler.set_epoch(1);
        let second = sampler.indices();

        assert_ne!(first, second);
        let mut sorted = second.clone();
        sorted.sort();
        assert_eq!(sorted, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn distributed_shards_pad_and_cover_dataset() {
        let shards: Vec<Vec<usize>> = (0..3)
            .map(|rank| DistributedSampler::new(7, 3, rank, false, 0).indices())
            .collect();

        assert_eq!(shards[0], vec![0, 3, 6]);
        assert_eq!(shards[1], vec![1, 4, 0]);
        assert_eq!(shards[2], vec![2, 5, 1]);
        let covered: BTreeSet<usize> = shards.iter().flatten().copied().collect();
        assert_eq!(covered.len(), 7);
        assert!(shards.iter().all(|shard| shard.len() == 3));
    }

    #[test]
    fn distributed_shuffle_agrees_across_ranks() {
        let mut shards = Vec::new();
        for rank in 0..2 {
            let mut sampler = DistributedSampler::new(10, 2, rank, true, 11);
            sampler.set_epoch(3);
            shards.push(sampler.indices());
        }
        let union: BTreeSet<usize> = shards.iter().flatten().copied().collect();
        assert_eq!(union, (0..10).collect());
        assert!(shards[0].iter().all(|idx| !shards[1].contains(idx)));
    }

    #[test]
    fn distributed_epoch_changes_order() {
        let mut sampler = DistributedSampler::new(50, 2, 0, true, 0);
        let first = sampler.indices();
        sampler.set_epoch(1);
        assert_ne!(first, sampler.indices());
    }

    #[test]
    fn empty_dataset_yields_nothing() {
        let sampler = DistributedSampler::new(0, 4, 2, true, 0);
        assert!(sampler.indices().is_empty());
        assert!(sampler.is_empty());
    }
}
