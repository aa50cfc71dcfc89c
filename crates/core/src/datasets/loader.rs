//! Batching, shuffling and rank sharding.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::dataset::{Dataset, VqaSample};
use super::error::Result;

/// A collated batch, as consumed by the model.
#[derive(Debug, Clone)]
pub struct Samples {
    /// `[B, 3, S, S]`
    pub image: Option<Tensor>,
    pub text_input: Vec<String>,
    pub text_output: Vec<String>,
    /// `[B]` u32
    pub image_id: Option<Tensor>,
}

impl Samples {
    pub fn len(&self) -> usize {
        self.text_input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text_input.is_empty()
    }

    pub fn collate(items: Vec<VqaSample>, device: &Device) -> Result<Self> {
        let mut images = Vec::with_capacity(items.len());
        let mut ids = Vec::with_capacity(items.len());
        let mut text_input = Vec::with_capacity(items.len());
        let mut text_output = Vec::with_capacity(items.len());
        for item in items {
            images.push(item.image);
            ids.push(item.image_id);
            text_input.push(item.text_input);
            text_output.push(item.text_output);
        }
        let (image, image_id) = if images.is_empty() {
            (None, None)
        } else {
            (
                Some(Tensor::stack(&images, 0)?),
                Some(Tensor::new(ids, device)?),
            )
        };
        Ok(Self {
            image,
            text_input,
            text_output,
            image_id,
        })
    }
}

/// Iterates a dataset in fixed-size batches.
///
/// With `shard(rank, world_size)` each rank sees a disjoint, equally sized
/// slice of the (shuffled) index order; the order is padded by wrapping so
/// every rank gets the same number of batches.
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    rank: usize,
    world_size: usize,
    drop_last: bool,
    device: Device,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn Dataset>) -> Self {
        Self {
            dataset,
            batch_size: 16,
            shuffle: false,
            seed: 42,
            rank: 0,
            world_size: 1,
            drop_last: false,
            device: Device::Cpu,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn shard(mut self, rank: usize, world_size: usize) -> Self {
        self.world_size = world_size.max(1);
        self.rank = rank.min(self.world_size - 1);
        self
    }

    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Samples seen by this rank per epoch.
    pub fn num_samples(&self) -> usize {
        self.dataset.len().div_ceil(self.world_size)
    }

    /// Batches per epoch on this rank.
    pub fn num_batches(&self) -> usize {
        let n = self.num_samples();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    /// This rank's indices for `epoch`. Shuffling is seeded by
    /// `seed + epoch`, so every rank draws the same permutation.
    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        let len = self.dataset.len();
        if len == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        let total = self.num_samples() * self.world_size;
        let mut i = 0;
        while order.len() < total {
            order.push(order[i]);
            i += 1;
        }
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    pub fn epoch(&self, epoch: usize) -> Batches<'_> {
        Batches {
            loader: self,
            indices: self.indices(epoch),
            pos: 0,
        }
    }
}

pub struct Batches<'a> {
    loader: &'a DataLoader,
    indices: Vec<usize>,
    pos: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Samples>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.indices.len().saturating_sub(self.pos);
        let bs = self.loader.batch_size;
        if remaining == 0 || (self.loader.drop_last && remaining < bs) {
            return None;
        }
        let end = self.pos + remaining.min(bs);
        let batch = &self.indices[self.pos..end];
        self.pos = end;
        let device = &self.loader.device;
        let items = batch
            .iter()
            .map(|&i| self.loader.dataset.get(i, device))
            .collect::<Result<Vec<_>>>();
        Some(items.and_then(|items| Samples::collate(items, device)))
    }
}
