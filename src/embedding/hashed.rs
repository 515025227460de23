//! Deterministic feature-hashing embedding provider.
//!
//! Each lowercase word contributes its character trigrams (with word-boundary markers) to a
//! 384-bucket histogram, which is then L2-normalized. Inflections of the same stem share
//! most trigrams, so "prefers" and "preferred" land close together without any model files.

use anyhow::Result;
use sha2::{Digest, Sha256};

use super::{l2_normalize, truncate_chars, EmbeddingProvider, EMBEDDING_DIM};

pub const HASHED_MODEL_ID: &str = "hashed-trigram-384";

pub struct HashedEmbeddingProvider {
    max_input_chars: usize,
}

impl HashedEmbeddingProvider {
    pub fn new(max_input_chars: usize) -> Self {
        Self { max_input_chars }
    }
}

impl Default for HashedEmbeddingProvider {
    fn default() -> Self {
        Self::new(2000)
    }
}

impl EmbeddingProvider for HashedEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate_chars(text, self.max_input_chars).to_lowercase();
        let mut buckets = vec![0.0f32; EMBEDDING_DIM];

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let padded: Vec<char> = std::iter::once('^')
                .chain(word.chars())
                .chain(std::iter::once('$'))
                .collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                let (bucket, sign) = hash_feature(&gram);
                buckets[bucket] += sign;
            }
        }

        Ok(l2_normalize(&buckets))
    }

    fn model_id(&self) -> &str {
        HASHED_MODEL_ID
    }

    fn max_input_chars(&self) -> usize {
        self.max_input_chars
    }
}

/// Stable bucket index and sign for a feature string.
fn hash_feature(feature: &str) -> (usize, f32) {
    let digest = Sha256::digest(feature.as_bytes());
    let idx = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize;
    let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
    (idx % EMBEDDING_DIM, sign)
}
