use anyhow::Result;
use rand::{rngs::StdRng, SeedableRng};
use tch::{
    nn::{Adam, Optimizer, OptimizerConfig, VarStore},
    no_grad, Device, Kind, Tensor,
};

use crate::{
    config::{ModelConfig, TrainConfig},
    dataset::{Corpus, Split},
    model::GenomeGpt,
};

/// Receives every scalar metric the training loop emits, keyed by name and
/// iteration. Injected into the loop so the loop itself has no opinion about
/// where metrics go.
pub trait MetricsSink {
    fn record(&mut self, iter: usize, name: &str, value: f64);
}

/// Writes metrics as aligned log lines.
pub struct ConsoleSink;

impl MetricsSink for ConsoleSink {
    fn record(&mut self, iter: usize, name: &str, value: f64) {
        log::info!("iter {:5} | {}: {:.4}", iter, name, value);
    }
}

/// Fraction of positions where the argmax prediction equals the target.
fn batch_accuracy(logits: &Tensor, targets: &Tensor) -> f64 {
    let predictions = logits.argmax(-1, false);
    predictions
        .eq_tensor(targets)
        .to_kind(Kind::Float)
        .mean(Kind::Float)
        .double_value(&[])
}

pub struct Trainer {
    var_store: VarStore,
    model: GenomeGpt,
    optimizer: Optimizer,
    corpus: Corpus,
    rng: StdRng,
    model_config: ModelConfig,
    train_config: TrainConfig,
}

impl Trainer {
    pub fn new(
        device: Device,
        corpus: Corpus,
        model_config: ModelConfig,
        train_config: TrainConfig,
    ) -> Result<Trainer> {
        let var_store = VarStore::new(device);
        let model = GenomeGpt::new(&var_store.root(), &model_config);
        let optimizer = Adam::default().build(&var_store, train_config.learning_rate)?;
        let rng = StdRng::seed_from_u64(train_config.seed);
        Ok(Trainer {
            var_store,
            model,
            optimizer,
            corpus,
            rng,
            model_config,
            train_config,
        })
    }

    pub fn model(&self) -> &GenomeGpt {
        &self.model
    }

    pub fn device(&self) -> Device {
        self.var_store.device()
    }

    /// Runs the main loop: one optimizer step per iteration, training metrics
    /// every 10 iterations, and a full validation pass every `eval_interval`
    /// iterations plus one on the final iteration. Evaluation always
    /// completes before the next training step begins.
    pub fn train(&mut self, sink: &mut dyn MetricsSink) -> Result<()> {
        let max_iters = self.train_config.max_iters;
        for iter in 0..max_iters {
            if iter % self.train_config.eval_interval == 0 || iter == max_iters - 1 {
                let (val_loss, val_acc) =
                    self.evaluate(Split::Validation, self.train_config.eval_iters);
                sink.record(iter, "val_loss", val_loss);
                sink.record(iter, "val_acc", val_acc);
            }

            let (input, target) = self.sample_batch(Split::Train);
            let (logits, loss) = self.model.forward_loss(&input, &target, true);
            // Zero gradients, backpropagate, apply one Adam update.
            self.optimizer.backward_step(&loss);

            if iter % 10 == 0 {
                let train_loss = loss.double_value(&[]);
                let train_accuracy = no_grad(|| batch_accuracy(&logits, &target));
                sink.record(iter, "train_loss", train_loss);
                sink.record(iter, "train_accuracy", train_accuracy);
            }
        }
        Ok(())
    }

    /// Held-out pass after training: mean loss and accuracy over
    /// `test_iters` batches.
    pub fn test(&mut self, sink: &mut dyn MetricsSink) -> (f64, f64) {
        let (test_loss, test_acc) = self.evaluate(Split::Test, self.train_config.test_iters);
        let final_iter = self.train_config.max_iters;
        sink.record(final_iter, "test_loss", test_loss);
        sink.record(final_iter, "test_acc", test_acc);
        (test_loss, test_acc)
    }

    /// Mean loss and accuracy over `iters` sampled batches, with gradients
    /// and dropout disabled for the whole pass.
    fn evaluate(&mut self, split: Split, iters: usize) -> (f64, f64) {
        let mut total_loss = 0.0;
        let mut total_accuracy = 0.0;
        for _ in 0..iters {
            let (input, target) = self.sample_batch(split);
            let (loss, accuracy) = no_grad(|| {
                let (logits, loss) = self.model.forward_loss(&input, &target, false);
                (loss.double_value(&[]), batch_accuracy(&logits, &target))
            });
            total_loss += loss;
            total_accuracy += accuracy;
        }
        (total_loss / iters as f64, total_accuracy / iters as f64)
    }

    fn sample_batch(&mut self, split: Split) -> (Tensor, Tensor) {
        let (input, target) = self.corpus.sample(
            split,
            self.train_config.batch_size,
            self.model_config.block_size as usize,
            &mut self.rng,
        );
        let device = self.var_store.device();
        (input.to_device(device), target.to_device(device))
    }
}
