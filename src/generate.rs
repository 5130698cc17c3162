use anyhow::Result;
use tch::{Device, IndexOp, Kind::Float, Tensor};

use crate::{model::GenomeGpt, tokenizer::Tokenizer};

/// Streams sampled DNA symbols from a trained model, one base per `next()`.
///
/// Holds a rolling context window that is trimmed to the model's block size
/// after every step, and a no-grad guard for the whole lifetime of the
/// stream. Ends after `max_new_tokens` draws, or early if the model samples
/// the padding sentinel.
pub struct SequenceStream<'a> {
    _no_grad_guard: tch::NoGradGuard,
    model: &'a GenomeGpt,
    tokenizer: Tokenizer,
    window: Tensor,
    temperature: f64,
    remaining: usize,
}

impl<'a> SequenceStream<'a> {
    pub fn new(
        model: &'a GenomeGpt,
        tokenizer: &Tokenizer,
        seed: &str,
        device: Device,
        temperature: f64,
        max_new_tokens: usize,
    ) -> Result<Self> {
        let mut seed_tokens = tokenizer.encode(seed)?;
        anyhow::ensure!(!seed_tokens.is_empty(), "seed sequence is empty");
        // Only the last block_size seed tokens can influence generation.
        let block_size = model.block_size() as usize;
        if seed_tokens.len() > block_size {
            seed_tokens.drain(..seed_tokens.len() - block_size);
        }
        let window = Tensor::from_slice(&seed_tokens)
            .to_device(device)
            .unsqueeze(0);
        Ok(SequenceStream {
            _no_grad_guard: tch::no_grad_guard(),
            model,
            tokenizer: tokenizer.clone(),
            window,
            temperature,
            remaining: max_new_tokens,
        })
    }
}

impl Iterator for SequenceStream<'_> {
    type Item = char;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        // Logits for the whole window: [1, seq_len, vocab]; only the final
        // position predicts the next base.
        let logits = self.model.forward(&self.window, false);
        let final_logits = logits.i((0, -1, ..));
        let temperature_adjusted = final_logits / self.temperature;
        let probabilities = temperature_adjusted.softmax(-1, Float);
        let sampled = probabilities.multinomial(1, false);
        let token = sampled.int64_value(&[0]);
        // The padding sentinel carries no base; treat it as end of stream.
        let base = self.tokenizer.symbol(token)?;
        // Append, then trim the window back to the block size.
        self.window = Tensor::cat(&[&self.window, &sampled.unsqueeze(0)], 1);
        let len = self.window.size()[1];
        let block_size = self.model.block_size();
        if len > block_size {
            self.window = self.window.narrow(1, len - block_size, block_size);
        }
        Some(base)
    }
}
