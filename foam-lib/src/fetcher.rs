use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::FoamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Sequential,
    Shuffled { seed: u64 },
}

/// Cyclic batch iterator over a fixed slice.
///
/// Sequential mode walks `0..N` in order; the last batch of a pass may be
/// shorter, and the next call starts over at 0. Shuffled mode walks a
/// random permutation and draws a new one whenever it runs out, filling
/// every batch to full size.
///
/// Two fetchers used side by side (rays and colors) are not linked in any
/// way: the caller keeps them aligned by calling `next` on both once per
/// step.
#[derive(Debug)]
pub struct BatchFetcher<'a, T> {
    data: &'a [T],
    batch_size: usize,
    order: Option<(Vec<usize>, StdRng)>,
    cursor: usize,
    epoch: usize,
}

impl<'a, T> BatchFetcher<'a, T> {
    pub fn new(data: &'a [T], batch_size: usize, mode: FetchMode) -> Result<Self, FoamError> {
        if data.is_empty() {
            return Err(FoamError::consistency("cannot fetch batches from an empty array"));
        }
        if batch_size == 0 {
            return Err(FoamError::consistency("batch size must be at least 1"));
        }
        let order = match mode {
            FetchMode::Sequential => None,
            FetchMode::Shuffled { seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut permutation: Vec<usize> = (0..data.len()).collect();
                permutation.shuffle(&mut rng);
                Some((permutation, rng))
            }
        };
        Ok(Self {
            data,
            batch_size,
            order,
            cursor: 0,
            epoch: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of completed passes over the data.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn next_indices(&mut self) -> Vec<usize> {
        let n = self.data.len();
        match &mut self.order {
            None => {
                if self.cursor >= n {
                    self.cursor = 0;
                }
                let end = (self.cursor + self.batch_size).min(n);
                let batch = (self.cursor..end).collect();
                self.cursor = end;
                if end == n {
                    self.epoch += 1;
                }
                batch
            }
            Some((permutation, rng)) => {
                let mut batch = Vec::with_capacity(self.batch_size);
                while batch.len() < self.batch_size {
                    if self.cursor >= n {
                        permutation.shuffle(rng);
                        self.cursor = 0;
                    }
                    let take = (self.batch_size - batch.len()).min(n - self.cursor);
                    batch.extend_from_slice(&permutation[self.cursor..self.cursor + take]);
                    self.cursor += take;
                    if self.cursor == n {
                        self.epoch += 1;
                    }
                }
                batch
            }
        }
    }

    pub fn next(&mut self) -> Vec<&'a T> {
        let data = self.data;
        self.next_indices().into_iter().map(|i| &data[i]).collect()
    }
}
