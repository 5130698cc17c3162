use anyhow::{Context, Result};
use rand::Rng;
use tch::Tensor;

use crate::tokenizer::{Tokenizer, PAD_TOKEN};

/// Which contiguous line range a batch is drawn from.
///
/// `Test` resolves to the same line range as `Validation`: the corpus carries
/// a two-way partition, and the final held-out pass reads the tail lines just
/// as periodic validation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
    Test,
}

/// A line-oriented corpus of fixed-width DNA windows, every line pre-encoded
/// to token indices at load time; sampling a batch is index arithmetic over
/// the in-memory lines.
///
/// The first `train_lines` lines form the training partition; the remainder
/// is validation. Partitions are contiguous and never overlap.
#[derive(Debug)]
pub struct Corpus {
    lines: Vec<Vec<i64>>,
    train_lines: usize,
}

impl Corpus {
    /// Reads one window per line from `path`. Any symbol outside the DNA
    /// alphabet fails the load.
    pub fn from_file(path: &str, tokenizer: &Tokenizer, train_ratio: f64) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read corpus file {}", path))?;
        Self::from_lines(text.lines(), tokenizer, train_ratio)
    }

    pub fn from_lines<'a>(
        lines: impl IntoIterator<Item = &'a str>,
        tokenizer: &Tokenizer,
        train_ratio: f64,
    ) -> Result<Self> {
        let lines = lines
            .into_iter()
            .map(|line| tokenizer.encode(line))
            .collect::<Result<Vec<_>>>()?;
        anyhow::ensure!(!lines.is_empty(), "corpus has no lines");
        let train_lines = (lines.len() as f64 * train_ratio) as usize;
        Ok(Corpus { lines, train_lines })
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn train_lines(&self) -> usize {
        self.train_lines
    }

    pub fn validation_lines(&self) -> usize {
        self.lines.len() - self.train_lines
    }

    fn split_range(&self, split: Split) -> (usize, usize) {
        match split {
            Split::Train => (0, self.train_lines),
            Split::Validation | Split::Test => (self.train_lines, self.lines.len()),
        }
    }

    /// Draws a batch of up to `batch_size` consecutive lines starting at a
    /// uniformly random line of the split, each right-padded to `block_size`
    /// with the padding sentinel.
    ///
    /// Returns `(input, target)` Int64 tensors of shape
    /// `[actual_batch, block_size]`, where `target` is `input` shifted left
    /// one position with the final column repeated. When the random start
    /// lands near the end of the partition the batch shrinks to the lines
    /// that remain; it never wraps into the other partition.
    ///
    /// The split must be non-empty.
    pub fn sample(
        &self,
        split: Split,
        batch_size: usize,
        block_size: usize,
        rng: &mut impl Rng,
    ) -> (Tensor, Tensor) {
        let (lo, hi) = self.split_range(split);
        let start = lo + rng.gen_range(0..hi - lo);
        let take = batch_size.min(hi - start);

        let mut inputs = Vec::with_capacity(take);
        let mut targets = Vec::with_capacity(take);
        for line in &self.lines[start..start + take] {
            let mut window = line.clone();
            window.truncate(block_size);
            window.resize(block_size, PAD_TOKEN);
            // Next-token targets: left shift, last column repeated.
            let mut shifted = window[1..].to_vec();
            shifted.push(window[block_size - 1]);
            inputs.push(Tensor::from_slice(&window));
            targets.push(Tensor::from_slice(&shifted));
        }
        (Tensor::stack(&inputs, 0), Tensor::stack(&targets, 0))
    }
}
