use crate::tokenizer;

/// Architecture hyperparameters. Built once in `main` and passed by reference
/// to every component constructor; nothing reads these from globals.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Number of distinct token indices, including the padding sentinel.
    pub vocab_size: i64,
    /// Maximum number of positions the model attends over at once.
    pub block_size: i64,
    /// Width of the per-position feature vector.
    pub n_embd: i64,
    /// Number of parallel attention heads per block.
    pub n_head: i64,
    /// Number of stacked transformer blocks.
    pub n_layer: i64,
    /// Dropout probability, active only in training mode.
    pub dropout: f64,
}

impl ModelConfig {
    pub fn head_dim(&self) -> i64 {
        self.n_embd / self.n_head
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            vocab_size: tokenizer::VOCAB_SIZE,
            block_size: 128,
            n_embd: 128,
            n_head: 4,
            n_layer: 4,
            dropout: 0.1,
        }
    }
}

/// Optimization and evaluation schedule.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub max_iters: usize,
    /// Run a validation pass every this many iterations (and on the last one).
    pub eval_interval: usize,
    /// Number of sampled batches averaged per validation pass.
    pub eval_iters: usize,
    /// Number of sampled batches averaged in the final held-out pass.
    pub test_iters: usize,
    /// Fraction of corpus lines assigned to the training partition.
    pub train_ratio: f64,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            batch_size: 32,
            learning_rate: 3e-4,
            max_iters: 5000,
            eval_interval: 500,
            eval_iters: 200,
            test_iters: 200,
            train_ratio: 0.9,
            seed: 42,
        }
    }
}
