//! Still-frame similarity scoring
//!
//! Combines a windowed structural-similarity score (local mean, variance
//! and covariance of luminance) with a luminance histogram correlation:
//! `0.7 * ssim + 0.3 * histogram`, clamped to [0,1]. Frames smaller than
//! one analysis window fall back to a PSNR-derived score.
//!
//! A stage matches only when every reference image in its set matches;
//! scoring never short-circuits, so failed comparisons still carry the
//! full per-reference score list for diagnostics.

use image::imageops::{self, FilterType};
use image::RgbaImage;
use machqa_common::profile::ReferenceImageSet;
use serde::Serialize;

const SSIM_WINDOW: u32 = 8;
const SSIM_WEIGHT: f64 = 0.7;
const HIST_WEIGHT: f64 = 0.3;
/// PSNR at or above this maps to a fallback score of 1.0
const PSNR_FULL_SCORE_DB: f64 = 30.0;

/// Score for one reference image
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceScore {
    pub reference: String,
    /// Combined score in [0,1]
    pub score: f64,
    pub ssim: f64,
    pub histogram: f64,
    /// Set when the PSNR fallback decided the score
    pub psnr_db: Option<f64>,
    pub matched: bool,
    /// Reference was resampled to the frame's dimensions before comparing
    pub resized: bool,
}

/// Result of comparing one frame against a reference set
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonOutcome {
    pub all_matched: bool,
    pub threshold: f64,
    pub scores: Vec<ReferenceScore>,
}

impl ComparisonOutcome {
    pub fn score_values(&self) -> Vec<f64> {
        self.scores.iter().map(|s| s.score).collect()
    }

    pub fn matched_count(&self) -> usize {
        self.scores.iter().filter(|s| s.matched).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} references matched at threshold {:.2}",
            self.matched_count(),
            self.scores.len(),
            self.threshold
        )
    }
}

/// Compare a captured frame against every image of a reference set
pub fn compare_against_set(
    frame: &RgbaImage,
    set: &ReferenceImageSet,
    threshold: f64,
) -> ComparisonOutcome {
    let mut scores = Vec::with_capacity(set.images.len());
    let mut all_matched = !set.images.is_empty();

    for (name, reference) in &set.images {
        let mut score = compare_images(frame, reference, threshold);
        score.reference = name.clone();
        if !score.matched {
            all_matched = false;
        }
        scores.push(score);
    }

    ComparisonOutcome {
        all_matched,
        threshold,
        scores,
    }
}

/// Compare a captured frame against a single reference image
pub fn compare_images(frame: &RgbaImage, reference: &RgbaImage, threshold: f64) -> ReferenceScore {
    let resized = frame.dimensions() != reference.dimensions();
    let resampled;
    let reference = if resized {
        // never crop or pad: resample the reference to the frame's size
        resampled = imageops::resize(
            reference,
            frame.width(),
            frame.height(),
            FilterType::Lanczos3,
        );
        &resampled
    } else {
        reference
    };

    let frame_luma = luminance_plane(frame);
    let reference_luma = luminance_plane(reference);
    let (width, height) = frame.dimensions();

    if width < SSIM_WINDOW || height < SSIM_WINDOW {
        // too small for windowed statistics
        let (score, psnr_db) = psnr_score(&frame_luma, &reference_luma);
        return ReferenceScore {
            reference: String::new(),
            score,
            ssim: 0.0,
            histogram: 0.0,
            psnr_db: Some(psnr_db),
            matched: score >= threshold,
            resized,
        };
    }

    let ssim = windowed_ssim(&frame_luma, &reference_luma, width as usize, height as usize);
    let histogram = histogram_correlation(&frame_luma, &reference_luma).max(0.0);
    let score = (SSIM_WEIGHT * ssim + HIST_WEIGHT * histogram).clamp(0.0, 1.0);

    ReferenceScore {
        reference: String::new(),
        score,
        ssim,
        histogram,
        psnr_db: None,
        matched: score >= threshold,
        resized,
    }
}

/// Single-channel luminance plane (Rec.601 weights), values in 0..=255
fn luminance_plane(image: &RgbaImage) -> Vec<f64> {
    image
        .pixels()
        .map(|p| 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64)
        .collect()
}

/// Mean structural similarity over non-overlapping windows, in [-1,1]
fn windowed_ssim(a: &[f64], b: &[f64], width: usize, height: usize) -> f64 {
    let window = SSIM_WINDOW as usize;
    let c1 = (0.01f64 * 255.0).powi(2);
    let c2 = (0.03f64 * 255.0).powi(2);

    let mut total = 0.0;
    let mut windows = 0usize;

    let mut y = 0;
    while y + window <= height {
        let mut x = 0;
        while x + window <= width {
            let n = (window * window) as f64;
            let mut mean_a = 0.0;
            let mut mean_b = 0.0;
            for wy in 0..window {
                let row = (y + wy) * width + x;
                for wx in 0..window {
                    mean_a += a[row + wx];
                    mean_b += b[row + wx];
                }
            }
            mean_a /= n;
            mean_b /= n;

            let mut var_a = 0.0;
            let mut var_b = 0.0;
            let mut cov = 0.0;
            for wy in 0..window {
                let row = (y + wy) * width + x;
                for wx in 0..window {
                    let da = a[row + wx] - mean_a;
                    let db = b[row + wx] - mean_b;
                    var_a += da * da;
                    var_b += db * db;
                    cov += da * db;
                }
            }
            var_a /= n;
            var_b /= n;
            cov /= n;

            let numerator = (2.0 * mean_a * mean_b + c1) * (2.0 * cov + c2);
            let denominator =
                (mean_a * mean_a + mean_b * mean_b + c1) * (var_a + var_b + c2);
            total += (numerator / denominator).clamp(-1.0, 1.0);
            windows += 1;

            x += window;
        }
        y += window;
    }

    if windows == 0 {
        0.0
    } else {
        total / windows as f64
    }
}

/// Pearson correlation of the 256-bin luminance histograms, in [-1,1]
fn histogram_correlation(a: &[f64], b: &[f64]) -> f64 {
    let hist_a = histogram(a);
    let hist_b = histogram(b);

    let n = 256.0;
    let mean_a: f64 = hist_a.iter().sum::<f64>() / n;
    let mean_b: f64 = hist_b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..256 {
        let da = hist_a[i] - mean_a;
        let db = hist_b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denominator = (var_a * var_b).sqrt();
    if denominator == 0.0 {
        // both flat (e.g. both empty) counts as identical distributions
        if var_a == 0.0 && var_b == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        (cov / denominator).clamp(-1.0, 1.0)
    }
}

fn histogram(luma: &[f64]) -> [f64; 256] {
    let mut bins = [0.0f64; 256];
    for &value in luma {
        let bin = (value.round() as i64).clamp(0, 255) as usize;
        bins[bin] += 1.0;
    }
    bins
}

/// Fallback score from mean-squared error: zero error scores 1.0,
/// otherwise the PSNR is normalized against 30 dB
fn psnr_score(a: &[f64], b: &[f64]) -> (f64, f64) {
    let len = a.len().min(b.len());
    if len == 0 {
        return (0.0, 0.0);
    }
    let mse: f64 = (0..len).map(|i| (a[i] - b[i]).powi(2)).sum::<f64>() / len as f64;
    if mse == 0.0 {
        return (1.0, f64::INFINITY);
    }
    let psnr = 20.0 * (255.0 / mse.sqrt()).log10();
    ((psnr / PSNR_FULL_SCORE_DB).clamp(0.0, 1.0), psnr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    /// Smooth low-frequency test pattern
    fn gradient(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            let fx = x as f64 / width as f64;
            let fy = y as f64 / height as f64;
            let v = (127.0 + 90.0 * (fx * std::f64::consts::PI).sin()
                + 30.0 * (fy * std::f64::consts::PI).cos())
            .clamp(0.0, 255.0) as u8;
            Rgba([v, v / 2 + 40, 255 - v, 255])
        })
    }

    fn solid(width: u32, height: u32, value: u8) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba([value, value, value, 255]))
    }

    #[test]
    fn identical_images_score_one() {
        let img = gradient(64, 64);
        let score = compare_images(&img, &img, 0.8);
        assert!((score.score - 1.0).abs() < 1e-9, "score = {}", score.score);
        assert!(score.matched);
        assert!(!score.resized);
    }

    #[test]
    fn black_frame_scores_low_against_content() {
        let content = gradient(64, 64);
        let black = solid(64, 64, 0);
        let score = compare_images(&black, &content, 0.8);
        assert!(score.score < 0.3, "score = {}", score.score);
        assert!(!score.matched);
    }

    #[test]
    fn resampled_reference_scores_within_tolerance() {
        let frame = gradient(64, 64);
        let same_size = compare_images(&frame, &frame, 0.8);

        // reference at a different size gets resampled back to 64x64
        let larger = imageops::resize(&frame, 80, 80, FilterType::Lanczos3);
        let resampled = compare_images(&frame, &larger, 0.8);

        assert!(resampled.resized);
        assert!(
            (same_size.score - resampled.score).abs() < 0.02,
            "same = {}, resampled = {}",
            same_size.score,
            resampled.score
        );
    }

    #[test]
    fn tiny_frames_use_psnr_fallback() {
        let a = solid(4, 4, 100);
        let identical = compare_images(&a, &a, 0.8);
        assert_eq!(identical.score, 1.0);
        assert!(identical.psnr_db.is_some());

        let b = solid(4, 4, 140);
        let differing = compare_images(&a, &b, 0.8);
        assert!(differing.psnr_db.is_some());
        assert!(differing.score < 1.0);
        assert!(differing.score > 0.0);
    }

    #[test]
    fn set_requires_every_reference_to_match() {
        let frame = gradient(64, 64);
        let set = ReferenceImageSet {
            name: "entry".to_string(),
            images: vec![
                ("a.png".to_string(), frame.clone()),
                ("b.png".to_string(), solid(64, 64, 0)),
            ],
        };

        let outcome = compare_against_set(&frame, &set, 0.8);
        assert!(!outcome.all_matched);
        // both references were still scored
        assert_eq!(outcome.scores.len(), 2);
        assert!(outcome.scores[0].matched);
        assert!(!outcome.scores[1].matched);
        assert_eq!(outcome.matched_count(), 1);
    }

    #[test]
    fn empty_set_never_matches() {
        let frame = gradient(16, 16);
        let set = ReferenceImageSet {
            name: "empty".to_string(),
            images: Vec::new(),
        };
        let outcome = compare_against_set(&frame, &set, 0.5);
        assert!(!outcome.all_matched);
        assert!(outcome.scores.is_empty());
    }
}
