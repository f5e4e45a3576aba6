//! Reference-free frame anomaly detection
//!
//! Flags degenerate frames (black, transparent, stuck single-color) during
//! stages that are expected to show continuous motion, without comparing
//! against any reference image. Pixels are sampled on a regular grid and
//! classified; the three resulting percentages are checked against the
//! profile thresholds.

use image::RgbaImage;
use machqa_common::profile::FrameAnomalyThresholds;
use serde::Serialize;

/// Outcome of inspecting one frame
#[derive(Debug, Clone, Serialize)]
pub struct FrameAnomalyReport {
    pub black_percent: f64,
    pub transparent_percent: f64,
    /// Share of samples falling into the dominant quantized color bucket
    pub monochrome_percent: f64,
    pub sampled_pixels: u64,
    pub anomalies: Vec<String>,
}

impl FrameAnomalyReport {
    pub fn is_anomalous(&self) -> bool {
        !self.anomalies.is_empty()
    }

    pub fn describe(&self) -> String {
        if self.anomalies.is_empty() {
            format!(
                "frame normal (black {:.1}%, transparent {:.1}%, dominant color {:.1}%)",
                self.black_percent, self.transparent_percent, self.monochrome_percent
            )
        } else {
            self.anomalies.join("; ")
        }
    }
}

/// Sample the frame and classify it against the thresholds
pub fn inspect_frame(frame: &RgbaImage, thresholds: &FrameAnomalyThresholds) -> FrameAnomalyReport {
    let step = thresholds.sample_step.max(1);
    let (width, height) = frame.dimensions();

    let mut sampled = 0u64;
    let mut black = 0u64;
    let mut transparent = 0u64;
    // 4 bits per channel: 4096 buckets
    let mut buckets = vec![0u64; 4096];

    let mut y = 0;
    while y < height {
        let mut x = 0;
        while x < width {
            let pixel = frame.get_pixel(x, y);
            sampled += 1;

            let luminance =
                0.299 * pixel[0] as f64 + 0.587 * pixel[1] as f64 + 0.114 * pixel[2] as f64;
            if luminance < thresholds.black_luminance {
                black += 1;
            }
            if (pixel[3] as f64) < thresholds.alpha_cutoff {
                transparent += 1;
            }

            let bucket = ((pixel[0] as usize >> 4) << 8)
                | ((pixel[1] as usize >> 4) << 4)
                | (pixel[2] as usize >> 4);
            buckets[bucket] += 1;

            x += step;
        }
        y += step;
    }

    if sampled == 0 {
        return FrameAnomalyReport {
            black_percent: 0.0,
            transparent_percent: 0.0,
            monochrome_percent: 0.0,
            sampled_pixels: 0,
            anomalies: vec!["empty capture: frame has no pixels".to_string()],
        };
    }

    let dominant = buckets.iter().copied().max().unwrap_or(0);
    let black_percent = black as f64 * 100.0 / sampled as f64;
    let transparent_percent = transparent as f64 * 100.0 / sampled as f64;
    let monochrome_percent = dominant as f64 * 100.0 / sampled as f64;

    let mut anomalies = Vec::new();
    if black_percent >= thresholds.black_percent {
        anomalies.push(format!(
            "black frame: {black_percent:.1}% of sampled pixels below luminance {:.0}",
            thresholds.black_luminance
        ));
    }
    if transparent_percent >= thresholds.transparent_percent {
        anomalies.push(format!(
            "transparent frame: {transparent_percent:.1}% of sampled pixels below alpha {:.0}",
            thresholds.alpha_cutoff
        ));
    }
    if monochrome_percent >= thresholds.monochrome_percent {
        anomalies.push(format!(
            "monochrome frame: {monochrome_percent:.1}% of sampled pixels share one color"
        ));
    }

    FrameAnomalyReport {
        black_percent,
        transparent_percent,
        monochrome_percent,
        sampled_pixels: sampled,
        anomalies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn thresholds() -> FrameAnomalyThresholds {
        FrameAnomalyThresholds::default()
    }

    fn noisy_frame(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            let r = ((x * 37 + y * 11) % 256) as u8;
            let g = ((x * 13 + y * 29) % 256) as u8;
            let b = ((x * 7 + y * 53) % 256) as u8;
            Rgba([r, g, b, 255])
        })
    }

    #[test]
    fn black_frame_is_flagged_regardless_of_low_threshold() {
        let frame = RgbaImage::from_pixel(64, 64, Rgba([0, 0, 0, 255]));

        let report = inspect_frame(&frame, &thresholds());
        assert!(report.black_percent >= 99.0);
        assert!(report.is_anomalous());

        // a stricter (lower) configured threshold must still flag it
        let strict = FrameAnomalyThresholds {
            black_percent: 50.0,
            ..thresholds()
        };
        assert!(inspect_frame(&frame, &strict).is_anomalous());
    }

    #[test]
    fn transparent_frame_is_flagged() {
        let frame = RgbaImage::from_pixel(32, 32, Rgba([200, 200, 200, 0]));
        let report = inspect_frame(&frame, &thresholds());
        assert!(report.transparent_percent >= 99.0);
        assert!(report
            .anomalies
            .iter()
            .any(|a| a.contains("transparent")));
    }

    #[test]
    fn solid_color_frame_is_flagged_as_monochrome() {
        let frame = RgbaImage::from_pixel(32, 32, Rgba([120, 40, 200, 255]));
        let report = inspect_frame(&frame, &thresholds());
        assert!(report.monochrome_percent >= 99.0);
        assert!(report
            .anomalies
            .iter()
            .any(|a| a.contains("monochrome")));
    }

    #[test]
    fn varied_content_passes() {
        let report = inspect_frame(&noisy_frame(64, 64), &thresholds());
        assert!(!report.is_anomalous(), "anomalies: {:?}", report.anomalies);
        assert!(report.black_percent < 50.0);
    }

    #[test]
    fn sampling_step_reduces_sample_count() {
        let frame = noisy_frame(64, 64);
        let dense = inspect_frame(
            &frame,
            &FrameAnomalyThresholds {
                sample_step: 1,
                ..thresholds()
            },
        );
        let sparse = inspect_frame(
            &frame,
            &FrameAnomalyThresholds {
                sample_step: 8,
                ..thresholds()
            },
        );
        assert_eq!(dense.sampled_pixels, 64 * 64);
        assert_eq!(sparse.sampled_pixels, 8 * 8);
    }
}
