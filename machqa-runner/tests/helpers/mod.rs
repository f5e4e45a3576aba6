//! Shared test helpers: a scriptable [`UiDriver`] and profile builders

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use machqa_common::profile::{
    CaptureScope, FrameAnomalyThresholds, ImageComparisonConfig, MachineProfile, MatchRules,
    ProfileSet, ReferenceImageSet, ResolvedProfile, StageDefinition, StageKind,
};
use machqa_common::report::{ConsoleError, TargetTask};
use machqa_runner::driver::{AudioChunk, ClickTarget, DriverError, UiDriver};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Varied frame that passes anomaly detection
pub fn noisy_frame(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        let r = ((x * 37 + y * 11) % 256) as u8;
        let g = ((x * 13 + y * 29) % 256) as u8;
        let b = ((x * 7 + y * 53) % 256) as u8;
        Rgba([r, g, b, 255])
    })
}

/// Stereo chunks that pass the default audio thresholds
pub fn healthy_audio(chunks: usize) -> Vec<AudioChunk> {
    (0..chunks)
        .map(|_| AudioChunk {
            left: (0..2048).map(|i| 0.2 * (i as f32 * 0.05).sin()).collect(),
            right: (0..2048)
                .map(|i| 0.2 * (i as f32 * 0.05 + 1.5).sin())
                .collect(),
            sample_rate: 48_000,
        })
        .collect()
}

/// Scriptable in-memory driver
pub struct MockDriver {
    navigate_failures: AtomicU32,
    capture_failures: AtomicU32,
    /// When set, navigation re-arms `capture_failures` to this value, making
    /// captures fail a fixed number of times per target
    capture_failures_per_target: Option<u32>,
    capture_delay: Option<Duration>,
    fail_clicks: bool,
    frame: Mutex<RgbaImage>,
    audio_chunks: Mutex<Vec<AudioChunk>>,
    pub navigations: AtomicU32,
    pub captures: AtomicU32,
    pub clicks: AtomicU32,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            navigate_failures: AtomicU32::new(0),
            capture_failures: AtomicU32::new(0),
            capture_failures_per_target: None,
            capture_delay: None,
            fail_clicks: false,
            frame: Mutex::new(noisy_frame(64, 64)),
            audio_chunks: Mutex::new(Vec::new()),
            navigations: AtomicU32::new(0),
            captures: AtomicU32::new(0),
            clicks: AtomicU32::new(0),
        }
    }

    pub fn with_navigate_failures(self, count: u32) -> Self {
        self.navigate_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_capture_failures(self, count: u32) -> Self {
        self.capture_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn failing_first_capture_per_target(mut self) -> Self {
        self.capture_failures_per_target = Some(1);
        self
    }

    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = Some(delay);
        self
    }

    pub fn with_failing_clicks(mut self) -> Self {
        self.fail_clicks = true;
        self
    }

    pub fn with_frame(self, frame: RgbaImage) -> Self {
        *self.frame.lock().unwrap() = frame;
        self
    }

    pub fn with_audio_chunks(self, chunks: Vec<AudioChunk>) -> Self {
        *self.audio_chunks.lock().unwrap() = chunks;
        self
    }
}

#[async_trait]
impl UiDriver for MockDriver {
    async fn navigate(&self, task: &TargetTask) -> Result<(), DriverError> {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        if self
            .navigate_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DriverError::Action(format!("navigate to {}", task.code)));
        }
        if let Some(count) = self.capture_failures_per_target {
            self.capture_failures.store(count, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn capture_frame(&self, _scope: &CaptureScope) -> Result<RgbaImage, DriverError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.capture_delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .capture_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DriverError::Capture("screenshot failed".to_string()));
        }
        Ok(self.frame.lock().unwrap().clone())
    }

    async fn capture_audio(
        &self,
        _duration: Duration,
    ) -> Result<mpsc::Receiver<AudioChunk>, DriverError> {
        let chunks = self.audio_chunks.lock().unwrap().clone();
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            let _ = tx.try_send(chunk);
        }
        Ok(rx)
    }

    async fn perform_click(&self, target: &ClickTarget) -> Result<(), DriverError> {
        self.clicks.fetch_add(1, Ordering::SeqCst);
        if self.fail_clicks {
            return Err(DriverError::Action(format!("click {target:?}")));
        }
        Ok(())
    }

    async fn drain_console_errors(&self) -> Vec<ConsoleError> {
        Vec::new()
    }
}

/// Video-check stage with the default anomaly thresholds and no references
pub fn video_stage(name: &str, retry_count: u32, timeout_secs: f64) -> StageDefinition {
    StageDefinition {
        name: name.to_string(),
        description: String::new(),
        enabled: true,
        timeout_secs,
        retry_count,
        kind: StageKind::VideoCheck {
            anomaly: FrameAnomalyThresholds::default(),
            scope: CaptureScope::FullPage,
            image: None,
        },
    }
}

pub fn entry_stage(retry_count: u32, image: Option<ImageComparisonConfig>) -> StageDefinition {
    StageDefinition {
        name: "entry".to_string(),
        description: String::new(),
        enabled: true,
        timeout_secs: 5.0,
        retry_count,
        kind: StageKind::Entry { image },
    }
}

pub fn audio_stage(name: &str, retry_count: u32) -> StageDefinition {
    StageDefinition {
        name: name.to_string(),
        description: String::new(),
        enabled: true,
        timeout_secs: 5.0,
        retry_count,
        kind: StageKind::AudioCheck { audio: None },
    }
}

/// Wrap stage definitions into an in-memory resolved profile
pub fn resolved_profile(stages: Vec<StageDefinition>) -> ResolvedProfile {
    resolved_profile_with_references(stages, HashMap::new())
}

pub fn resolved_profile_with_references(
    stages: Vec<StageDefinition>,
    references: HashMap<String, Arc<ReferenceImageSet>>,
) -> ResolvedProfile {
    ResolvedProfile {
        profile: MachineProfile {
            name: "TEST".to_string(),
            description: String::new(),
            enabled: true,
            match_rules: MatchRules::default(),
            stages,
            audio: Default::default(),
            dir: PathBuf::new(),
        },
        references,
    }
}

/// Profile set with one profile under the given keyword
pub fn profile_set(keyword: &str, profile: ResolvedProfile) -> Arc<ProfileSet> {
    let mut profiles = HashMap::new();
    profiles.insert(keyword.to_string(), Arc::new(profile));
    Arc::new(ProfileSet::from_profiles(profiles))
}

pub fn reference_set(name: &str, images: Vec<(&str, RgbaImage)>) -> Arc<ReferenceImageSet> {
    Arc::new(ReferenceImageSet {
        name: name.to_string(),
        images: images
            .into_iter()
            .map(|(file, img)| (file.to_string(), img))
            .collect(),
    })
}
