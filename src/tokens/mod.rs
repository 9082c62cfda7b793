//! Raw token estimation for payloads that carry no usage record.

/// Approximate characters per token for English-heavy chat traffic.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;

    fn estimate_bytes(&self, bytes: &[u8]) -> u64 {
        self.estimate(&String::from_utf8_lossy(bytes))
    }
}

/// `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> u64 {
        let chars = text.chars().count();
        chars.div_ceil(self.chars_per_token) as u64
    }
}
