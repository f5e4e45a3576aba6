//! Sampled audio quality analysis
//!
//! Consumes the bounded sample chunks the driver pushes over its channel
//! and scores them against the profile thresholds: average and peak
//! loudness, clipping ratio, left/right channel correlation (to catch
//! duplicated-channel "stereo") and a diagnostic noise floor.

use crate::driver::AudioChunk;
use machqa_common::profile::AudioThresholds;
use serde::Serialize;
use tokio::sync::mpsc;

/// RMS below this is treated as no signal at all
const AUDIBLE_RMS: f64 = 1e-4;
/// dB value reported for digital silence
const SILENCE_FLOOR_DB: f64 = -100.0;

/// Aggregated audio metrics plus the issues that failed the check
#[derive(Debug, Clone, Serialize)]
pub struct AudioAnalysis {
    pub has_audio: bool,
    pub avg_volume_db: f64,
    pub peak_volume_db: f64,
    pub clipping_ratio: f64,
    pub channel_correlation: f64,
    pub is_stereo: bool,
    pub noise_floor_db: f64,
    pub chunk_count: usize,
    pub sample_count: usize,
    pub issues: Vec<String>,
}

impl AudioAnalysis {
    pub fn passed(&self) -> bool {
        self.has_audio && self.issues.is_empty()
    }

    pub fn describe(&self) -> String {
        if self.issues.is_empty() {
            format!(
                "audio ok (avg {:.1} dB, peak {:.1} dB, clip {:.4}, correlation {:.3})",
                self.avg_volume_db, self.peak_volume_db, self.clipping_ratio,
                self.channel_correlation
            )
        } else {
            self.issues.join("; ")
        }
    }
}

/// Drain the capture channel to completion, then analyze everything received
pub async fn analyze_stream(
    mut rx: mpsc::Receiver<AudioChunk>,
    thresholds: &AudioThresholds,
) -> AudioAnalysis {
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    analyze_chunks(&chunks, thresholds)
}

/// Score a finished set of sample chunks
pub fn analyze_chunks(chunks: &[AudioChunk], thresholds: &AudioThresholds) -> AudioAnalysis {
    let mut analysis = AudioAnalysis {
        has_audio: false,
        avg_volume_db: SILENCE_FLOOR_DB,
        peak_volume_db: SILENCE_FLOOR_DB,
        clipping_ratio: 0.0,
        channel_correlation: 0.0,
        is_stereo: false,
        noise_floor_db: SILENCE_FLOOR_DB,
        chunk_count: chunks.len(),
        sample_count: chunks.iter().map(AudioChunk::sample_count).sum(),
        issues: Vec::new(),
    };

    if chunks.is_empty() || analysis.sample_count == 0 {
        analysis
            .issues
            .push("no audio samples captured (audio may not be playing)".to_string());
        return analysis;
    }

    let mut rms_dbs = Vec::with_capacity(chunks.len());
    let mut peak = 0.0f64;
    let mut clip_ratios = Vec::with_capacity(chunks.len());
    let mut correlations = Vec::new();

    for chunk in chunks {
        let rms = chunk_rms(chunk);
        if rms > AUDIBLE_RMS {
            rms_dbs.push(to_db(rms));
            if let Some(correlation) = channel_correlation(&chunk.left, &chunk.right) {
                correlations.push(correlation);
            }
        }

        peak = chunk
            .left
            .iter()
            .chain(chunk.right.iter())
            .fold(peak, |acc, &s| acc.max(s.abs() as f64));

        let total = chunk.sample_count();
        if total > 0 {
            let clipped = chunk
                .left
                .iter()
                .chain(chunk.right.iter())
                .filter(|s| s.abs() as f64 >= thresholds.clip_amplitude)
                .count();
            clip_ratios.push(clipped as f64 / total as f64);
        }
    }

    // loudness
    if rms_dbs.is_empty() {
        analysis
            .issues
            .push("no audio output at all (silent)".to_string());
    } else {
        analysis.has_audio = true;
        analysis.avg_volume_db = rms_dbs.iter().sum::<f64>() / rms_dbs.len() as f64;
        analysis.peak_volume_db = to_db(peak);

        if analysis.avg_volume_db < thresholds.silence_db {
            analysis.has_audio = false;
            analysis.issues.push(format!(
                "average volume {:.1} dB below silence threshold {:.1} dB",
                analysis.avg_volume_db, thresholds.silence_db
            ));
        } else if analysis.avg_volume_db < thresholds.min_db {
            analysis.issues.push(format!(
                "too quiet: average {:.1} dB below minimum {:.1} dB",
                analysis.avg_volume_db, thresholds.min_db
            ));
        }

        if analysis.peak_volume_db > thresholds.max_db {
            analysis.issues.push(format!(
                "too loud: peak {:.1} dB above limit {:.1} dB",
                analysis.peak_volume_db, thresholds.max_db
            ));
        }
    }

    // clipping
    if !clip_ratios.is_empty() {
        analysis.clipping_ratio = clip_ratios.iter().sum::<f64>() / clip_ratios.len() as f64;
        if analysis.clipping_ratio > thresholds.clip_ratio {
            analysis.issues.push(format!(
                "clipping/distortion: ratio {:.4} above {:.4}",
                analysis.clipping_ratio, thresholds.clip_ratio
            ));
        }
    }

    // channels: correlation 1.0 means both channels carry the same signal
    if !correlations.is_empty() {
        analysis.channel_correlation =
            correlations.iter().sum::<f64>() / correlations.len() as f64;
        analysis.is_stereo = analysis.channel_correlation < thresholds.correlation_threshold;
        if thresholds.require_stereo && !analysis.is_stereo {
            analysis.issues.push(format!(
                "effectively mono: channel correlation {:.4} at or above {:.4}",
                analysis.channel_correlation, thresholds.correlation_threshold
            ));
        }
    }

    // noise floor: mean of the quietest fifth of audible chunks (diagnostic)
    if !rms_dbs.is_empty() {
        let mut sorted = rms_dbs.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let quietest = &sorted[..(sorted.len() / 5).max(1)];
        analysis.noise_floor_db = quietest.iter().sum::<f64>() / quietest.len() as f64;
    }

    analysis
}

fn chunk_rms(chunk: &AudioChunk) -> f64 {
    let total = chunk.sample_count();
    if total == 0 {
        return 0.0;
    }
    let sum_squares: f64 = chunk
        .left
        .iter()
        .chain(chunk.right.iter())
        .map(|&s| (s as f64) * (s as f64))
        .sum();
    (sum_squares / total as f64).sqrt()
}

fn to_db(amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        20.0 * amplitude.log10()
    } else {
        SILENCE_FLOOR_DB
    }
}

/// Pearson correlation between the two channel buffers
fn channel_correlation(left: &[f32], right: &[f32]) -> Option<f64> {
    let n = left.len().min(right.len());
    if n == 0 {
        return None;
    }

    let mut sum_ll = 0.0f64;
    let mut sum_rr = 0.0f64;
    let mut sum_lr = 0.0f64;
    for i in 0..n {
        let l = left[i] as f64;
        let r = right[i] as f64;
        sum_ll += l * l;
        sum_rr += r * r;
        sum_lr += l * r;
    }

    let denominator = (sum_ll * sum_rr).sqrt();
    if denominator == 0.0 {
        None
    } else {
        Some((sum_lr / denominator).clamp(-1.0, 1.0))
    }
}
