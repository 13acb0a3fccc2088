//! Content fingerprints used for duplicate detection.
//!
//! Every filtered article gets two fingerprints:
//! - `content_hash`: SHA-256 over the normalized token stream, so copies that only differ in
//!   case, whitespace or punctuation collide exactly.
//! - `simhash`: a 64-bit locality-sensitive hash over weighted token shingles. Near-identical
//!   texts land a few bits apart. The hash is split into [`SIMHASH_BANDS`] bands that are
//!   stored in indexed columns, so candidate lookup is an equality scan. With 4 bands any two
//!   hashes within Hamming distance 3 share at least one band.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

pub const SIMHASH_BITS: u32 = 64;
pub const SIMHASH_BANDS: usize = 4;
const BAND_WIDTH: u32 = SIMHASH_BITS / SIMHASH_BANDS as u32;
const SHINGLE_WIDTH: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub content_hash: String,
    pub simhash: u64,
}

impl Fingerprint {
    pub fn bands(&self) -> [i64; SIMHASH_BANDS] {
        simhash_bands(self.simhash)
    }
}

/// Computes both fingerprints, or `None` when the text has no usable tokens.
pub fn fingerprint(text: &str) -> Option<Fingerprint> {
    let tokens = normalize_tokens(text);
    if tokens.is_empty() {
        return None;
    }

    let simhash = simhash(&tokens)?;
    Some(Fingerprint {
        content_hash: content_hash(&tokens),
        simhash,
    })
}

/// NFKC + lowercase + Unicode word segmentation. Han characters come out as one token each.
pub fn normalize_tokens(text: &str) -> Vec<String> {
    let normalized: String = text.nfkc().collect::<String>().to_lowercase();
    normalized
        .unicode_words()
        .filter(|w| w.chars().any(|c| c.is_alphanumeric()))
        .map(|w| w.to_string())
        .collect()
}

fn content_hash(tokens: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tokens.join(" ").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn feature_hash(feature: &str) -> u64 {
    let digest = Sha256::digest(feature.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Weighted SimHash over token shingles (unigrams for single-token texts).
pub fn simhash(tokens: &[String]) -> Option<u64> {
    if tokens.is_empty() {
        return None;
    }

    let mut weights: HashMap<String, i64> = HashMap::new();
    if tokens.len() < SHINGLE_WIDTH {
        for token in tokens {
            *weights.entry(token.clone()).or_insert(0) += 1;
        }
    } else {
        for window in tokens.windows(SHINGLE_WIDTH) {
            *weights.entry(window.join(" ")).or_insert(0) += 1;
        }
    }

    let mut v = [0i64; SIMHASH_BITS as usize];
    for (feature, weight) in &weights {
        let h = feature_hash(feature);
        for (i, slot) in v.iter_mut().enumerate() {
            if (h >> i) & 1 == 1 {
                *slot += weight;
            } else {
                *slot -= weight;
            }
        }
    }

    let mut fingerprint: u64 = 0;
    for (i, slot) in v.iter().enumerate() {
        if *slot > 0 {
            fingerprint |= 1 << i;
        }
    }
    Some(fingerprint)
}

/// Splits a SimHash into equal-width bands, lowest bits first.
pub fn simhash_bands(simhash: u64) -> [i64; SIMHASH_BANDS] {
    let mask = (1u64 << BAND_WIDTH) - 1;
    let mut bands = [0i64; SIMHASH_BANDS];
    for (i, band) in bands.iter_mut().enumerate() {
        *band = ((simhash >> (i as u32 * BAND_WIDTH)) & mask) as i64;
    }
    bands
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

// SQLite integers are signed; the bit pattern is what matters.
pub fn simhash_to_db(simhash: u64) -> i64 {
    simhash as i64
}

pub fn simhash_from_db(value: i64) -> u64 {
    value as u64
}
