use tch::{
    nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, LinearConfig, Path},
    IndexOp,
    Kind::{Bool, Float},
    Tensor,
};

use crate::config::ModelConfig;

struct Embeddings {
    token: Embedding,
    position: Embedding,
}

impl Embeddings {
    pub fn new(vs: &Path, config: &ModelConfig) -> Self {
        let token = embedding(vs / "token", config.vocab_size, config.n_embd, Default::default());
        let position = embedding(
            vs / "position",
            config.block_size,
            config.n_embd,
            Default::default(),
        );
        Embeddings { token, position }
    }

    /// Takes a tensor of token IDs with shape `[batch_size, seq_len]` and returns
    /// a tensor of shape `[batch_size, seq_len, n_embd]` where each token ID
    /// has been replaced by the sum of its token embedding and its position embedding.
    pub fn forward(&self, input: &Tensor) -> Tensor {
        let token_embeds = input.apply(&self.token);
        let seq_length = input.size()[1];
        // Position indices [0, 1, ..., seq_len-1], replicated per batch item.
        let position_ids = Tensor::arange(seq_length, (tch::Kind::Int64, input.device()))
            .unsqueeze(0)
            .expand(&input.size(), true);
        let position_embeds = position_ids.apply(&self.position);
        token_embeds + position_embeds
    }
}

/// Single-head causal self-attention.
/// Takes an input of shape [batch_size, seq_len, n_embd] and produces
/// an output of [batch_size, seq_len, head_dim], where each position's output
/// is a weighted combination of the values at positions up to and including
/// itself, with weights determined by query-key compatibility scores.
struct SingleHeadAttention {
    query: Linear, // Projects n_embd -> head_dim
    key: Linear,   // Projects n_embd -> head_dim
    value: Linear, // Projects n_embd -> head_dim
    /// Upper-triangular Bool buffer of shape [block_size, block_size], built
    /// once and sliced to the live sequence length on every call.
    mask: Tensor,
    scale: f64,
    dropout: f64,
}

impl SingleHeadAttention {
    pub fn new(vs: &Path, config: &ModelConfig) -> Self {
        let head_dim = config.head_dim();
        let no_bias = LinearConfig {
            bias: false,
            ..Default::default()
        };
        let query = linear(vs / "query", config.n_embd, head_dim, no_bias);
        let key = linear(vs / "key", config.n_embd, head_dim, no_bias);
        let value = linear(vs / "value", config.n_embd, head_dim, no_bias);
        // True above the diagonal marks positions that must not be attended.
        let mask = Tensor::ones(
            &[config.block_size, config.block_size],
            (Float, vs.device()),
        )
        .triu(1)
        .to_kind(Bool);

        SingleHeadAttention {
            query,
            key,
            value,
            mask,
            scale: f64::sqrt(config.n_embd as f64),
            dropout: config.dropout,
        }
    }

    pub fn forward(&self, input: &Tensor, train: bool) -> Tensor {
        let seq_length = input.size()[1];
        let q_embeds = input.apply(&self.query);
        let k_embeds = input.apply(&self.key);
        let v_embeds = input.apply(&self.value);
        // Attention scores are Q @ K^T, scaled down before softmax.
        let attention_scores = q_embeds.matmul(&k_embeds.transpose(-2, -1)) / self.scale;
        // Slice the precomputed mask to the live length; position i may only
        // see positions j <= i.
        let future_masked_attention_scores = attention_scores.masked_fill(
            &self.mask.i((..seq_length, ..seq_length)),
            f64::NEG_INFINITY,
        );
        let attention_weights = future_masked_attention_scores
            .softmax(-1, Float)
            .dropout(self.dropout, train);
        // Weighted sum over values: [batch, seq_len, head_dim].
        attention_weights.matmul(&v_embeds)
    }
}

struct MultiHeadAttention {
    heads: Vec<SingleHeadAttention>,
    output_projection: Linear,
    dropout: f64,
}

impl MultiHeadAttention {
    pub fn new(vs: &Path, config: &ModelConfig) -> MultiHeadAttention {
        assert_eq!(
            config.head_dim() * config.n_head,
            config.n_embd,
            "n_embd must be divisible by n_head"
        );
        let mut heads = Vec::with_capacity(config.n_head as usize);
        for i in 0..(config.n_head as usize) {
            heads.push(SingleHeadAttention::new(&(vs / i.to_string()), config));
        }
        let output_projection = linear(
            vs / "output",
            config.n_embd,
            config.n_embd,
            Default::default(),
        );
        MultiHeadAttention {
            heads,
            output_projection,
            dropout: config.dropout,
        }
    }

    pub fn forward(&self, input: &Tensor, train: bool) -> Tensor {
        // Concatenate the head outputs along the feature axis to restore
        // [batch, seq_len, n_embd], then project.
        let outputs: Vec<Tensor> = self
            .heads
            .iter()
            .map(|head| head.forward(input, train))
            .collect();
        Tensor::cat(&outputs, -1)
            .apply(&self.output_projection)
            .dropout(self.dropout, train)
    }
}

/// Position-wise feed-forward transform: expand to 4x width, rectify,
/// contract back. The same transform is applied independently at every
/// sequence position.
struct FeedForward {
    expand: Linear,
    contract: Linear,
    dropout: f64,
}

impl FeedForward {
    pub fn new(vs: &Path, config: &ModelConfig) -> Self {
        let hidden = 4 * config.n_embd;
        FeedForward {
            expand: linear(vs / "expand", config.n_embd, hidden, Default::default()),
            contract: linear(vs / "contract", hidden, config.n_embd, Default::default()),
            dropout: config.dropout,
        }
    }

    pub fn forward(&self, input: &Tensor, train: bool) -> Tensor {
        input
            .apply(&self.expand)
            .relu()
            .apply(&self.contract)
            .dropout(self.dropout, train)
    }
}

/// Pre-normalization residual block: normalize before each sub-layer, add the
/// residual after. Both normalizations have their own learnable scale/shift.
struct Block {
    ln1: LayerNorm,
    attention: MultiHeadAttention,
    ln2: LayerNorm,
    feed_forward: FeedForward,
}

impl Block {
    pub fn new(vs: &Path, config: &ModelConfig) -> Self {
        Block {
            ln1: layer_norm(vs / "ln1", vec![config.n_embd], Default::default()),
            attention: MultiHeadAttention::new(&(vs / "attention"), config),
            ln2: layer_norm(vs / "ln2", vec![config.n_embd], Default::default()),
            feed_forward: FeedForward::new(&(vs / "feed_forward"), config),
        }
    }

    pub fn forward(&self, input: &Tensor, train: bool) -> Tensor {
        let x = input + self.attention.forward(&input.apply(&self.ln1), train);
        &x + self.feed_forward.forward(&x.apply(&self.ln2), train)
    }
}

/// Character-level autoregressive transformer over the DNA alphabet:
/// token+position embeddings, a stack of pre-norm blocks, a final
/// normalization, and a projection to per-position vocabulary logits.
pub struct GenomeGpt {
    embeddings: Embeddings,
    blocks: Vec<Block>,
    ln_final: LayerNorm,
    lm_head: Linear,
    block_size: i64,
    vocab_size: i64,
}

impl GenomeGpt {
    pub fn new(vs: &Path, config: &ModelConfig) -> Self {
        let embeddings = Embeddings::new(&(vs / "embeddings"), config);
        let blocks_vs = vs / "blocks";
        let mut blocks = Vec::with_capacity(config.n_layer as usize);
        for i in 0..(config.n_layer as usize) {
            blocks.push(Block::new(&(&blocks_vs / i.to_string()), config));
        }
        let ln_final = layer_norm(vs / "ln_final", vec![config.n_embd], Default::default());
        let lm_head = linear(
            vs / "lm_head",
            config.n_embd,
            config.vocab_size,
            Default::default(),
        );
        GenomeGpt {
            embeddings,
            blocks,
            ln_final,
            lm_head,
            block_size: config.block_size,
            vocab_size: config.vocab_size,
        }
    }

    /// Maps token indices `[batch, seq_len]` to next-token logits
    /// `[batch, seq_len, vocab_size]`. The sequence length must not exceed
    /// the block size.
    pub fn forward(&self, input: &Tensor, train: bool) -> Tensor {
        let mut x = self.embeddings.forward(input);
        for block in &self.blocks {
            x = block.forward(&x, train);
        }
        x.apply(&self.ln_final).apply(&self.lm_head)
    }

    /// Forward pass plus mean cross-entropy against `targets` (same shape as
    /// `input`), computed over the flattened batch and sequence axes.
    pub fn forward_loss(&self, input: &Tensor, targets: &Tensor, train: bool) -> (Tensor, Tensor) {
        let logits = self.forward(input, train);
        let loss = logits
            .view([-1, self.vocab_size])
            .cross_entropy_for_logits(&targets.view([-1]));
        (logits, loss)
    }

    /// Autoregressive generation: starting from `seed` of shape
    /// `[batch, seed_len]`, appends `max_new_tokens` tokens one at a time,
    /// each drawn from the softmax of the final position's logits
    /// (`sample = true`) or picked by argmax (`sample = false`). The context
    /// is truncated to the last `block_size` tokens before every forward
    /// pass. Strictly sequential: each new token depends on all tokens
    /// generated before it.
    pub fn generate(&self, seed: &Tensor, max_new_tokens: usize, sample: bool) -> Tensor {
        let _no_grad_guard = tch::no_grad_guard();
        let mut sequence = seed.shallow_clone();
        for _ in 0..max_new_tokens {
            let len = sequence.size()[1];
            let context = if len > self.block_size {
                sequence.narrow(1, len - self.block_size, self.block_size)
            } else {
                sequence.shallow_clone()
            };
            let logits = self.forward(&context, false);
            // Only the final position predicts the next token: [batch, vocab].
            let final_logits = logits.i((.., -1, ..));
            let next_token = if sample {
                final_logits.softmax(-1, Float).multinomial(1, false)
            } else {
                final_logits.argmax(-1, false).unsqueeze(-1)
            };
            sequence = Tensor::cat(&[&sequence, &next_token], 1);
        }
        sequence
    }

    pub fn block_size(&self) -> i64 {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device, Kind};

    fn test_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 5,
            block_size: 8,
            n_embd: 16,
            n_head: 4,
            n_layer: 2,
            dropout: 0.0,
        }
    }

    /// Helper: random float input shaped [batch, seq_len, n_embd].
    fn random_embed_input(config: &ModelConfig, batch: i64, seq_len: i64) -> Tensor {
        Tensor::randn(&[batch, seq_len, config.n_embd], (Float, Device::Cpu))
    }

    #[test]
    fn test_embeddings_output_shape() {
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let embeddings = Embeddings::new(&vs.root(), &config);
        let input = Tensor::from_slice2(&[&[0i64, 1, 2, 3], &[3, 2, 1, 0]]);
        let output = embeddings.forward(&input);
        assert_eq!(output.size(), &[2, 4, config.n_embd]);
    }

    #[test]
    fn test_same_token_different_positions() {
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let embeddings = Embeddings::new(&vs.root(), &config);
        // Same token at every position; outputs should differ because of the
        // position embeddings.
        let input = Tensor::ones(&[1, 4], (Kind::Int64, Device::Cpu)) * 2;
        let output = embeddings.forward(&input);
        let pos0 = output.get(0).get(0);
        let pos1 = output.get(0).get(1);
        let diff = (&pos0 - &pos1).abs().sum(Kind::Float);
        assert!(f64::try_from(&diff).unwrap() > 0.0);
    }

    #[test]
    fn test_single_head_output_shape() {
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let head = SingleHeadAttention::new(&vs.root(), &config);
        let input = random_embed_input(&config, 2, 8);
        let output = head.forward(&input, false);
        assert_eq!(output.size(), &[2, 8, config.head_dim()]);
    }

    #[test]
    fn test_single_head_single_token() {
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let head = SingleHeadAttention::new(&vs.root(), &config);
        let input = random_embed_input(&config, 1, 1);
        let output = head.forward(&input, false);
        assert_eq!(output.size(), &[1, 1, config.head_dim()]);
    }

    #[test]
    fn test_single_head_causal_masking() {
        // Changing a future token must not affect an earlier position's output.
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let head = SingleHeadAttention::new(&vs.root(), &config);

        let input_a = random_embed_input(&config, 1, 4);
        let output_a = head.forward(&input_a, false);

        // Modify position 3; positions 0, 1, 2 should be unaffected.
        let input_b = input_a.copy();
        let noise = Tensor::randn(&[1, 1, config.n_embd], (Float, Device::Cpu));
        input_b.narrow(1, 3, 1).copy_(&noise);
        let output_b = head.forward(&input_b, false);

        for pos in 0..3 {
            let a = output_a.get(0).get(pos);
            let b = output_b.get(0).get(pos);
            let diff = (&a - &b).abs().sum(Float);
            assert!(
                f64::try_from(&diff).unwrap() < 1e-5,
                "Position {} changed when only a future token was modified",
                pos
            );
        }

        // Position 3 sees itself, which changed.
        let a3 = output_a.get(0).get(3);
        let b3 = output_b.get(0).get(3);
        let diff3 = (&a3 - &b3).abs().sum(Float);
        assert!(
            f64::try_from(&diff3).unwrap() > 1e-5,
            "Position 3 should have changed"
        );
    }

    #[test]
    fn test_mask_slicing_below_block_size() {
        // Sequences shorter than block_size slice the mask rather than
        // rebuilding it; the output must still be causal at that length.
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let head = SingleHeadAttention::new(&vs.root(), &config);
        let input_a = random_embed_input(&config, 1, 3);
        let output_a = head.forward(&input_a, false);

        let input_b = input_a.copy();
        let noise = Tensor::randn(&[1, 1, config.n_embd], (Float, Device::Cpu));
        input_b.narrow(1, 2, 1).copy_(&noise);
        let output_b = head.forward(&input_b, false);

        for pos in 0..2 {
            let diff = (&output_a.get(0).get(pos) - &output_b.get(0).get(pos))
                .abs()
                .sum(Float);
            assert!(f64::try_from(&diff).unwrap() < 1e-5);
        }
    }

    #[test]
    fn test_multi_head_output_shape() {
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let mha = MultiHeadAttention::new(&vs.root(), &config);
        let input = random_embed_input(&config, 2, 8);
        let output = mha.forward(&input, false);
        // Back to full n_embd after concatenation and projection.
        assert_eq!(output.size(), &[2, 8, config.n_embd]);
    }

    #[test]
    fn test_multi_head_causal_masking() {
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let mha = MultiHeadAttention::new(&vs.root(), &config);

        let input_a = random_embed_input(&config, 1, 4);
        let output_a = mha.forward(&input_a, false);

        let input_b = input_a.copy();
        let noise = Tensor::randn(&[1, 1, config.n_embd], (Float, Device::Cpu));
        input_b.narrow(1, 3, 1).copy_(&noise);
        let output_b = mha.forward(&input_b, false);

        for pos in 0..3 {
            let diff = (&output_a.get(0).get(pos) - &output_b.get(0).get(pos))
                .abs()
                .sum(Float);
            assert!(
                f64::try_from(&diff).unwrap() < 1e-5,
                "Position {} changed when only a future token was modified",
                pos
            );
        }
    }

    #[test]
    fn test_feed_forward_shape() {
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let ffwd = FeedForward::new(&vs.root(), &config);
        let input = random_embed_input(&config, 2, 4);
        assert_eq!(ffwd.forward(&input, false).size(), &[2, 4, config.n_embd]);
    }

    #[test]
    fn test_block_preserves_shape() {
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let block = Block::new(&vs.root(), &config);
        let input = random_embed_input(&config, 2, 8);
        assert_eq!(block.forward(&input, false).size(), &[2, 8, config.n_embd]);
    }

    #[test]
    fn test_model_logits_shape() {
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = GenomeGpt::new(&vs.root(), &config);
        let input = Tensor::from_slice2(&[&[0i64, 1, 2, 3, 4, 0, 1, 2]]);
        let logits = model.forward(&input, false);
        assert_eq!(logits.size(), &[1, 8, config.vocab_size]);
    }

    #[test]
    fn test_model_causality() {
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = GenomeGpt::new(&vs.root(), &config);

        let input_a = Tensor::from_slice2(&[&[0i64, 1, 2, 3]]);
        let input_b = Tensor::from_slice2(&[&[0i64, 1, 2, 0]]);
        let logits_a = model.forward(&input_a, false);
        let logits_b = model.forward(&input_b, false);

        // Logits at positions before the differing token are identical.
        for pos in 0..3 {
            let diff = (&logits_a.get(0).get(pos) - &logits_b.get(0).get(pos))
                .abs()
                .sum(Float);
            assert!(f64::try_from(&diff).unwrap() < 1e-5);
        }
    }

    #[test]
    fn test_initial_loss_near_uniform() {
        // An untrained model should be roughly uniform over the vocabulary,
        // putting the cross-entropy in the neighborhood of ln(vocab_size).
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = GenomeGpt::new(&vs.root(), &config);
        let input = Tensor::from_slice2(&[&[0i64, 1, 2, 3, 0, 1, 2, 3]]);
        let target = Tensor::from_slice2(&[&[1i64, 2, 3, 0, 1, 2, 3, 3]]);
        let (_, loss) = model.forward_loss(&input, &target, false);
        let loss = f64::try_from(&loss).unwrap();
        let uniform = (config.vocab_size as f64).ln();
        assert!(loss.is_finite());
        assert!(loss > 0.5 * uniform && loss < 3.0 * uniform);
    }

    #[test]
    fn test_greedy_generation_is_deterministic() {
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = GenomeGpt::new(&vs.root(), &config);
        let seed = Tensor::from_slice2(&[&[0i64, 1, 2]]);
        let a = model.generate(&seed, 12, false);
        let b = model.generate(&seed, 12, false);
        assert_eq!(a.size(), &[1, 15]);
        assert_eq!(a.eq_tensor(&b).all().int64_value(&[]), 1);
    }

    #[test]
    fn test_generation_truncates_context() {
        // Generating past block_size keeps working because the context is
        // truncated to the last block_size tokens before each forward pass.
        let config = test_config();
        let vs = nn::VarStore::new(Device::Cpu);
        let model = GenomeGpt::new(&vs.root(), &config);
        let seed = Tensor::from_slice2(&[&[0i64, 1]]);
        let generated = model.generate(&seed, 20, true);
        assert_eq!(generated.size(), &[1, 22]);
        assert_eq!(generated.lt(config.vocab_size).all().int64_value(&[]), 1);
        assert_eq!(generated.ge(0).all().int64_value(&[]), 1);
    }
}
