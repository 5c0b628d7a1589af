//! DCT-based perceptual hashing for near-duplicate render detection.
//!
//! The image is reduced to a 32×32 greyscale matrix, the lowest 8×8 block of
//! its two-dimensional DCT-II is taken, the DC term is dropped, and each of
//! the remaining 63 coefficients contributes one bit (set when above the
//! median). The bits are padded to 64 and rendered as 16 hex characters.
//!
//! Similarity is measured at hex-character granularity: two hashes differing
//! in one nibble score `1 - 1/64` no matter how many of that nibble's bits
//! differ. Stored hashes depend on this exact formula.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Edge of the reduced greyscale matrix.
pub const REDUCED_SIZE: u32 = 32;

/// Edge of the low-frequency DCT block kept for the signature.
pub const DCT_SIZE: usize = 8;

/// Length of a rendered hash in hex characters.
pub const HASH_HEX_LEN: usize = 16;

/// Similarity at or above which two renders count as duplicates.
pub const DEFAULT_DUPLICATE_THRESHOLD: f64 = 0.95;

// ---------------------------------------------------------------------------
// PerceptualHash
// ---------------------------------------------------------------------------

/// A 64-bit perceptual signature rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PerceptualHash(String);

impl PerceptualHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex-granularity similarity with another hash, in `[0, 1]`.
    pub fn similarity(&self, other: &PerceptualHash) -> f64 {
        similarity(&self.0, &other.0)
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PerceptualHash {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_HEX_LEN || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::Validation(format!(
                "Perceptual hash must be {HASH_HEX_LEN} hex characters, got '{s}'"
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for PerceptualHash {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PerceptualHash> for String {
    fn from(value: PerceptualHash) -> Self {
        value.0
    }
}

/// Errors raised while computing a hash.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("Failed to decode image for hashing: {0}")]
    Decode(#[from] image::ImageError),
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Decode `bytes` and compute their perceptual hash.
pub fn hash_bytes(bytes: &[u8]) -> Result<PerceptualHash, HashError> {
    let image = image::load_from_memory(bytes)?;
    Ok(hash_image(&image))
}

/// Compute the perceptual hash of an already decoded image.
pub fn hash_image(image: &DynamicImage) -> PerceptualHash {
    let grey = image.to_luma8();
    let reduced = image::imageops::resize(&grey, REDUCED_SIZE, REDUCED_SIZE, FilterType::Triangle);

    let n = REDUCED_SIZE as usize;
    let mut pixels = vec![0.0f64; n * n];
    for (x, y, p) in reduced.enumerate_pixels() {
        pixels[y as usize * n + x as usize] = f64::from(p.0[0]);
    }

    let coefficients = low_frequency_dct(&pixels, n);
    // Drop the DC term at (0, 0).
    let ac: Vec<f64> = coefficients.into_iter().skip(1).collect();
    let median = median(&ac);

    let mut bits: u64 = 0;
    for (i, value) in ac.iter().enumerate() {
        if *value > median {
            bits |= 1 << (63 - i);
        }
    }
    // 63 bits are significant; the lowest bit stays zero as padding.
    PerceptualHash(format!("{bits:016x}"))
}

/// Top-left `DCT_SIZE`×`DCT_SIZE` block of the orthonormal 2-D DCT-II of an
/// `n`×`n` row-major matrix, returned row-major (`u` rows, `v` columns).
fn low_frequency_dct(pixels: &[f64], n: usize) -> Vec<f64> {
    let nf = n as f64;
    let mut cos_table = vec![0.0f64; DCT_SIZE * n];
    for u in 0..DCT_SIZE {
        for x in 0..n {
            cos_table[u * n + x] = ((2.0 * x as f64 + 1.0) * u as f64 * PI / (2.0 * nf)).cos();
        }
    }
    let alpha = |k: usize| {
        if k == 0 {
            (1.0 / nf).sqrt()
        } else {
            (2.0 / nf).sqrt()
        }
    };

    let mut out = Vec::with_capacity(DCT_SIZE * DCT_SIZE);
    for u in 0..DCT_SIZE {
        for v in 0..DCT_SIZE {
            let mut sum = 0.0;
            for y in 0..n {
                let cy = cos_table[u * n + y];
                for x in 0..n {
                    sum += pixels[y * n + x] * cy * cos_table[v * n + x];
                }
            }
            out.push(alpha(u) * alpha(v) * sum);
        }
    }
    out
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

/// Similarity of two hex hashes: `1 - differing_chars / (len * 4)`.
///
/// Hashes of different lengths (or empty hashes) have similarity `0.0`.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let differing = a
        .chars()
        .zip(b.chars())
        .filter(|(x, y)| !x.eq_ignore_ascii_case(y))
        .count();
    1.0 - differing as f64 / (a.len() * 4) as f64
}

/// Whether two hashes are near-duplicates at `threshold`.
pub fn is_duplicate(a: &PerceptualHash, b: &PerceptualHash, threshold: f64) -> bool {
    a.similarity(b) >= threshold
}
