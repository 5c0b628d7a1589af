//! Deterministic image quality scoring for finished renders.
//!
//! Starting from a score of 1.0, each failing dimension deducts
//! independently: format, file size, resolution, and pixel statistics
//! (contrast, noise, entropy). The perceptual hash is computed on the way
//! through so the review queue can run its duplicate search without decoding
//! the image again.

use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::perceptual_hash::{hash_image, PerceptualHash};

// ---------------------------------------------------------------------------
// Deductions
// ---------------------------------------------------------------------------

/// Deduction for a format outside the allowed set.
pub const FORMAT_PENALTY: f64 = 0.3;
/// Deduction for an oversized file.
pub const FILE_SIZE_PENALTY: f64 = 0.2;
/// Deduction for a resolution below the minimum (or an undecodable image).
pub const RESOLUTION_PENALTY: f64 = 0.3;
/// Deduction when average channel contrast is below [`VERY_LOW_CONTRAST`].
pub const VERY_LOW_CONTRAST_PENALTY: f64 = 0.3;
/// Deduction when average channel contrast is below [`LOW_CONTRAST`].
pub const LOW_CONTRAST_PENALTY: f64 = 0.1;
/// Deduction when average channel deviation exceeds [`NOISE_STD_DEV`].
pub const NOISE_PENALTY: f64 = 0.2;
/// Deduction when normalised entropy is below [`MIN_ENTROPY`].
pub const LOW_ENTROPY_PENALTY: f64 = 0.2;

/// Average channel contrast (max − min) below which contrast is very low.
pub const VERY_LOW_CONTRAST: f64 = 50.0;
/// Average channel contrast below which contrast is low.
pub const LOW_CONTRAST: f64 = 100.0;
/// Average channel standard deviation above which the image reads as noise.
pub const NOISE_STD_DEV: f64 = 80.0;
/// Normalised byte-histogram entropy below which the image is too flat.
pub const MIN_ENTROPY: f64 = 0.5;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Acceptance thresholds for [`check_quality`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub min_width: u32,
    pub min_height: u32,
    pub max_file_size_bytes: u64,
    pub min_quality_score: f64,
    pub allowed_formats: Vec<String>,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_width: 512,
            min_height: 512,
            max_file_size_bytes: 10 * 1024 * 1024,
            min_quality_score: 0.7,
            allowed_formats: ["png", "jpg", "jpeg", "webp"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl QualityThresholds {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&self.min_quality_score) {
            return Err(CoreError::Validation(format!(
                "min_quality_score must be between 0.0 and 1.0, got {}",
                self.min_quality_score
            )));
        }
        if self.allowed_formats.is_empty() {
            return Err(CoreError::Validation(
                "allowed_formats must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn allows(&self, format: &str) -> bool {
        self.allowed_formats
            .iter()
            .any(|f| f.eq_ignore_ascii_case(format))
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub size_bytes: u64,
    pub perceptual_hash: Option<PerceptualHash>,
    /// Score from pixel statistics alone; `None` if the image did not decode.
    pub pixel_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityResult {
    pub passed: bool,
    pub score: f64,
    pub issues: Vec<String>,
    pub metadata: QualityMetadata,
}

/// Per-channel and image-wide pixel statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelStats {
    /// Mean over channels of `max - min` intensity.
    pub avg_contrast: f64,
    /// Mean over channels of the population standard deviation.
    pub avg_std_dev: f64,
    /// Shannon entropy of the byte histogram divided by 8 bits.
    pub entropy: f64,
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

/// Score `bytes` against `thresholds`.
pub fn check_quality(bytes: &[u8], thresholds: &QualityThresholds) -> QualityResult {
    let mut score = 1.0;
    let mut issues = Vec::new();

    let format = detect_format(bytes);
    if !thresholds.allows(&format) {
        issues.push(format!("Unsupported image format: {format}"));
        score -= FORMAT_PENALTY;
    }

    let size_bytes = bytes.len() as u64;
    if size_bytes > thresholds.max_file_size_bytes {
        issues.push(format!(
            "File size {size_bytes} bytes exceeds maximum of {} bytes",
            thresholds.max_file_size_bytes
        ));
        score -= FILE_SIZE_PENALTY;
    }

    let mut metadata = QualityMetadata {
        width: 0,
        height: 0,
        format,
        size_bytes,
        perceptual_hash: None,
        pixel_score: None,
    };

    let decoded = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(e) => {
            issues.push(format!("Image could not be decoded: {e}"));
            issues.push("Perceptual hash could not be computed".to_string());
            score -= RESOLUTION_PENALTY;
            return finish(score, issues, metadata, thresholds);
        }
    };

    metadata.width = decoded.width();
    metadata.height = decoded.height();
    if metadata.width < thresholds.min_width || metadata.height < thresholds.min_height {
        issues.push(format!(
            "Resolution {}x{} is below minimum {}x{}",
            metadata.width, metadata.height, thresholds.min_width, thresholds.min_height
        ));
        score -= RESOLUTION_PENALTY;
    }

    let stats = pixel_stats(&decoded);
    let pixel_score = pixel_score(&stats);
    score -= 1.0 - pixel_score;
    if pixel_score < thresholds.min_quality_score {
        issues.push(format!(
            "Image quality score {pixel_score:.2} is below minimum {:.2}",
            thresholds.min_quality_score
        ));
    }
    metadata.pixel_score = Some(pixel_score);

    if metadata.width == 0 || metadata.height == 0 {
        issues.push("Perceptual hash could not be computed for an empty image".to_string());
    } else {
        metadata.perceptual_hash = Some(hash_image(&decoded));
    }

    finish(score, issues, metadata, thresholds)
}

fn finish(
    score: f64,
    issues: Vec<String>,
    metadata: QualityMetadata,
    thresholds: &QualityThresholds,
) -> QualityResult {
    let score = score.clamp(0.0, 1.0);
    QualityResult {
        passed: issues.is_empty() && score >= thresholds.min_quality_score,
        score,
        issues,
        metadata,
    }
}

/// Format name from the file signature, `"unknown"` when unrecognised.
pub fn detect_format(bytes: &[u8]) -> String {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "png".to_string(),
        Ok(ImageFormat::Jpeg) => "jpeg".to_string(),
        Ok(ImageFormat::WebP) => "webp".to_string(),
        Ok(other) => other
            .extensions_str()
            .first()
            .map(|ext| ext.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        Err(_) => "unknown".to_string(),
    }
}

/// Score in `[0, 1]` from pixel statistics alone.
pub fn pixel_score(stats: &PixelStats) -> f64 {
    let mut score = 1.0;

    if stats.avg_contrast < VERY_LOW_CONTRAST {
        score -= VERY_LOW_CONTRAST_PENALTY;
    } else if stats.avg_contrast < LOW_CONTRAST {
        score -= LOW_CONTRAST_PENALTY;
    }
    if stats.avg_std_dev > NOISE_STD_DEV {
        score -= NOISE_PENALTY;
    }
    if stats.entropy < MIN_ENTROPY {
        score -= LOW_ENTROPY_PENALTY;
    }

    f64::clamp(score, 0.0, 1.0)
}

/// Contrast and deviation per RGB channel, entropy over all channel bytes.
pub fn pixel_stats(image: &DynamicImage) -> PixelStats {
    let rgb = image.to_rgb8();
    let raw = rgb.as_raw();
    let pixel_count = (raw.len() / 3) as f64;
    if pixel_count == 0.0 {
        return PixelStats {
            avg_contrast: 0.0,
            avg_std_dev: 0.0,
            entropy: 0.0,
        };
    }

    let mut min = [u8::MAX; 3];
    let mut max = [u8::MIN; 3];
    let mut sum = [0.0f64; 3];
    let mut sum_sq = [0.0f64; 3];
    let mut histogram = [0u64; 256];

    for px in raw.chunks_exact(3) {
        for c in 0..3 {
            let v = px[c];
            min[c] = min[c].min(v);
            max[c] = max[c].max(v);
            let f = f64::from(v);
            sum[c] += f;
            sum_sq[c] += f * f;
            histogram[v as usize] += 1;
        }
    }

    let mut contrast = 0.0;
    let mut std_dev = 0.0;
    for c in 0..3 {
        contrast += f64::from(max[c] - min[c]);
        let mean = sum[c] / pixel_count;
        let variance = (sum_sq[c] / pixel_count - mean * mean).max(0.0);
        std_dev += variance.sqrt();
    }

    let total = raw.len() as f64;
    let entropy_bits: f64 = histogram
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum();

    PixelStats {
        avg_contrast: contrast / 3.0,
        avg_std_dev: std_dev / 3.0,
        entropy: entropy_bits / 8.0,
    }
}
