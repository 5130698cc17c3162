use anyhow::Result;

/// The DNA alphabet, in index order.
pub const ALPHABET: [char; 4] = ['A', 'C', 'G', 'T'];
/// Sentinel used to right-pad short corpus lines. Deliberately outside the
/// alphabet so padding is never mistaken for a real base.
pub const PAD_TOKEN: i64 = 4;
/// Four bases plus the padding sentinel.
pub const VOCAB_SIZE: i64 = 5;

/// Bijective mapping between the four DNA bases and the indices `0..=3`.
/// Fixed at construction, stateless afterwards.
#[derive(Debug, Clone)]
pub struct Tokenizer {}

impl Tokenizer {
    pub fn new() -> Self {
        Tokenizer {}
    }

    pub fn encode(&self, sequence: &str) -> Result<Vec<i64>> {
        let mut tokens = Vec::with_capacity(sequence.len());
        for c in sequence.chars() {
            match ALPHABET.iter().position(|&base| base == c) {
                Some(index) => tokens.push(index as i64),
                None => return Err(anyhow::anyhow!("symbol outside the DNA alphabet: {:?}", c)),
            }
        }
        Ok(tokens)
    }

    pub fn decode(&self, tokens: &[i64]) -> Result<String> {
        let mut sequence = String::with_capacity(tokens.len());
        for &token in tokens {
            match self.symbol(token) {
                Some(base) => sequence.push(base),
                None if token == PAD_TOKEN => {}
                None => return Err(anyhow::anyhow!("invalid token index: {}", token)),
            }
        }
        Ok(sequence)
    }

    /// The base a token index stands for, or `None` for padding and
    /// out-of-range indices.
    pub fn symbol(&self, token: i64) -> Option<char> {
        ALPHABET.get(usize::try_from(token).ok()?).copied()
    }
}
