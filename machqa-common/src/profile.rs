//! Machine profile configuration
//!
//! Profiles live one per directory under the profiles root:
//!
//! ```text
//! machine_profiles/
//!     JJBX/
//!         config.json             (name, match rules; may embed test_flows)
//!         test_flows.json         (optional, ordered stage list)
//!         audio_config.json       (optional, audio threshold overrides)
//!         reference_images/
//!             entry/*.png
//!             video/*.png
//!     _default/
//!         audio_config.json       (optional, shared audio defaults)
//! ```
//!
//! Every profile is fully validated and its reference images decoded at
//! load time, before any worker starts. After that the whole set is
//! read-only and shared by all workers without copying.

use crate::{Error, Result};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

fn default_true() -> bool {
    true
}

fn default_similarity_threshold() -> f64 {
    0.8
}

fn default_stage_timeout() -> f64 {
    10.0
}

fn default_retry_count() -> u32 {
    3
}

/// What part of the page a capture covers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum CaptureScope {
    FullPage,
    Selector { selector: String },
    Region { x: u32, y: u32, width: u32, height: u32 },
}

impl Default for CaptureScope {
    fn default() -> Self {
        CaptureScope::FullPage
    }
}

/// Reference-image comparison settings for one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageComparisonConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Combined-score threshold in [0,1]; a capture matches a reference
    /// when its score reaches this value
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default)]
    pub scope: CaptureScope,
    /// Name of the reference image set; defaults to the stage name
    #[serde(default)]
    pub image_set: Option<String>,
}

/// Thresholds for reference-free frame anomaly detection
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameAnomalyThresholds {
    /// Flag when this share of sampled pixels is near-black (percent)
    pub black_percent: f64,
    /// Flag when this share of sampled pixels is near-transparent (percent)
    pub transparent_percent: f64,
    /// Flag when one quantized color bucket holds this share (percent)
    pub monochrome_percent: f64,
    /// Luminance (0-255) below which a pixel counts as near-black
    pub black_luminance: f64,
    /// Alpha (0-255) below which a pixel counts as near-transparent
    pub alpha_cutoff: f64,
    /// Sample every n-th pixel in each direction
    pub sample_step: u32,
}

impl Default for FrameAnomalyThresholds {
    fn default() -> Self {
        Self {
            black_percent: 95.0,
            transparent_percent: 95.0,
            monochrome_percent: 90.0,
            black_luminance: 10.0,
            alpha_cutoff: 10.0,
            sample_step: 4,
        }
    }
}

/// Audio quality thresholds, resolved per profile
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioThresholds {
    /// Capture duration in seconds
    pub duration_secs: f64,
    /// Average RMS below this is "too quiet" (dBFS)
    pub min_db: f64,
    /// Peak above this is "too loud" (dBFS)
    pub max_db: f64,
    /// Average RMS below this counts as silence (dBFS)
    pub silence_db: f64,
    /// Absolute amplitude at or above this counts toward clipping (0-1)
    pub clip_amplitude: f64,
    /// Flag clipping when the clipped-sample fraction exceeds this
    pub clip_ratio: f64,
    /// Whether duplicated-channel content fails the stage
    pub require_stereo: bool,
    /// L/R correlation at or above this means effectively mono
    pub correlation_threshold: f64,
    /// Diagnostic noise-floor reference level (dBFS), not pass/fail
    pub noise_floor_db: f64,
}

impl Default for AudioThresholds {
    fn default() -> Self {
        Self {
            duration_secs: 5.0,
            min_db: -40.0,
            max_db: -3.0,
            silence_db: -60.0,
            clip_amplitude: 0.95,
            clip_ratio: 0.01,
            require_stereo: true,
            correlation_threshold: 0.95,
            noise_floor_db: -55.0,
        }
    }
}

/// Partial audio settings; present fields override the resolved thresholds.
/// Mirrors the layered audio_config.json files (shared default first, then
/// the profile's own overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioOverrides {
    pub duration_secs: Option<f64>,
    pub min_db: Option<f64>,
    pub max_db: Option<f64>,
    pub silence_db: Option<f64>,
    pub clip_amplitude: Option<f64>,
    pub clip_ratio: Option<f64>,
    pub require_stereo: Option<bool>,
    pub correlation_threshold: Option<f64>,
    pub noise_floor_db: Option<f64>,
}

impl AudioThresholds {
    /// Apply a set of overrides on top of these thresholds
    pub fn merged(mut self, over: &AudioOverrides) -> Self {
        if let Some(v) = over.duration_secs {
            self.duration_secs = v;
        }
        if let Some(v) = over.min_db {
            self.min_db = v;
        }
        if let Some(v) = over.max_db {
            self.max_db = v;
        }
        if let Some(v) = over.silence_db {
            self.silence_db = v;
        }
        if let Some(v) = over.clip_amplitude {
            self.clip_amplitude = v;
        }
        if let Some(v) = over.clip_ratio {
            self.clip_ratio = v;
        }
        if let Some(v) = over.require_stereo {
            self.require_stereo = v;
        }
        if let Some(v) = over.correlation_threshold {
            self.correlation_threshold = v;
        }
        if let Some(v) = over.noise_floor_db {
            self.noise_floor_db = v;
        }
        self
    }
}

/// A named clickable control checked during button stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonSpec {
    pub name: String,
    /// CSS selector, or an `x,y` coordinate pair
    pub selector: String,
}

/// Stage behavior, a closed set of kinds each with its own typed payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageKind {
    /// Navigate into the target machine; the critical stage of every session
    Entry {
        #[serde(default)]
        image: Option<ImageComparisonConfig>,
    },
    /// Capture the game surface and flag degenerate frames
    VideoCheck {
        #[serde(default)]
        anomaly: FrameAnomalyThresholds,
        #[serde(default)]
        scope: CaptureScope,
        #[serde(default)]
        image: Option<ImageComparisonConfig>,
    },
    /// Click each configured control
    ButtonCheck {
        buttons: Vec<ButtonSpec>,
        #[serde(default)]
        image: Option<ImageComparisonConfig>,
    },
    /// Place each configured bet through the bet control
    BettingCheck {
        amounts: Vec<f64>,
        #[serde(default)]
        bet_selector: Option<String>,
        #[serde(default)]
        image: Option<ImageComparisonConfig>,
    },
    /// Sample audio output and score it against the profile thresholds
    AudioCheck {
        #[serde(default)]
        audio: Option<AudioOverrides>,
    },
    /// Free-form stage: optional clicks, anomaly check and comparison
    Custom {
        #[serde(default)]
        clicks: Vec<ButtonSpec>,
        #[serde(default)]
        anomaly: Option<FrameAnomalyThresholds>,
        #[serde(default)]
        scope: CaptureScope,
        #[serde(default)]
        image: Option<ImageComparisonConfig>,
    },
}

impl StageKind {
    pub fn is_entry(&self) -> bool {
        matches!(self, StageKind::Entry { .. })
    }

    pub fn image_config(&self) -> Option<&ImageComparisonConfig> {
        match self {
            StageKind::Entry { image }
            | StageKind::VideoCheck { image, .. }
            | StageKind::ButtonCheck { image, .. }
            | StageKind::BettingCheck { image, .. }
            | StageKind::Custom { image, .. } => image.as_ref(),
            StageKind::AudioCheck { .. } => None,
        }
    }
}

/// One named verification step in a target's ordered test flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stage_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(flatten)]
    pub kind: StageKind,
}

impl StageDefinition {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    /// Maximum attempts for this stage (`retry_count + 1`)
    pub fn max_attempts(&self) -> u32 {
        self.retry_count + 1
    }

    fn validate(&self, profile: &str) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config(format!(
                "profile '{profile}': stage with empty name"
            )));
        }
        if !(self.timeout_secs > 0.0) {
            return Err(Error::Config(format!(
                "profile '{profile}': stage '{}' has non-positive timeout {}",
                self.name, self.timeout_secs
            )));
        }
        if let Some(image) = self.kind.image_config() {
            if !(0.0..=1.0).contains(&image.similarity_threshold) {
                return Err(Error::Config(format!(
                    "profile '{profile}': stage '{}' similarity threshold {} outside [0,1]",
                    self.name, image.similarity_threshold
                )));
            }
        }
        Ok(())
    }
}

/// Rules used to match a target code to a profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchRules {
    /// Substring patterns checked against the full target code
    pub code_patterns: Vec<String>,
}

/// `config.json` document
#[derive(Debug, Deserialize)]
struct ProfileDoc {
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    match_rules: MatchRules,
    #[serde(default)]
    test_flows: Vec<StageDefinition>,
}

/// `test_flows.json` document
#[derive(Debug, Deserialize)]
struct FlowsDoc {
    test_flows: Vec<StageDefinition>,
}

/// Resolved configuration for one machine type, read-only after load
#[derive(Debug, Clone)]
pub struct MachineProfile {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub match_rules: MatchRules,
    /// Ordered stage list; an `Entry` stage, if present, governs the
    /// implicit navigate step and is not repeated in the regular sequence
    pub stages: Vec<StageDefinition>,
    pub audio: AudioThresholds,
    pub dir: PathBuf,
}

/// Ordered, non-empty set of decoded reference images for one stage
#[derive(Debug)]
pub struct ReferenceImageSet {
    pub name: String,
    /// (file name, decoded image), in file-name order
    pub images: Vec<(String, RgbaImage)>,
}

impl ReferenceImageSet {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// A profile plus its decoded reference image sets
#[derive(Debug)]
pub struct ResolvedProfile {
    pub profile: MachineProfile,
    /// Reference sets keyed by set name (usually the stage name)
    pub references: HashMap<String, Arc<ReferenceImageSet>>,
}

impl ResolvedProfile {
    pub fn references_for(&self, set_name: &str) -> Option<&Arc<ReferenceImageSet>> {
        self.references.get(set_name)
    }

    /// The enabled `Entry` stage definition, if the profile declares one
    pub fn entry_stage(&self) -> Option<&StageDefinition> {
        self.profile
            .stages
            .iter()
            .find(|s| s.enabled && s.kind.is_entry())
    }
}

/// All loaded profiles, shared read-only by every worker
#[derive(Debug, Default)]
pub struct ProfileSet {
    profiles: HashMap<String, Arc<ResolvedProfile>>,
}

impl ProfileSet {
    /// Build a set from already-resolved profiles, keyed by match keyword
    pub fn from_profiles(profiles: HashMap<String, Arc<ResolvedProfile>>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|(k, v)| (k.to_uppercase(), v))
                .collect(),
        }
    }

    /// Load every profile directory under `root`
    ///
    /// A malformed profile is a hard error: nothing starts with a bad
    /// configuration on disk.
    pub fn load(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "profiles directory not found: {}",
                root.display()
            )));
        }

        let shared_audio = load_audio_overrides(&root.join("_default").join("audio_config.json"))?;

        let mut profiles = HashMap::new();
        let mut entries: Vec<_> = std::fs::read_dir(root)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        entries.sort();

        for dir in entries {
            let key = match dir.file_name().and_then(|n| n.to_str()) {
                Some(name) if !name.starts_with('.') && !name.starts_with('_') => {
                    name.to_uppercase()
                }
                _ => continue,
            };
            let resolved = load_profile_dir(&dir, shared_audio.as_ref())?;
            info!(
                profile = %resolved.profile.name,
                stages = resolved.profile.stages.len(),
                reference_sets = resolved.references.len(),
                "Loaded machine profile"
            );
            profiles.insert(key, Arc::new(resolved));
        }

        Ok(Self { profiles })
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    pub fn get(&self, key: &str) -> Option<Arc<ResolvedProfile>> {
        self.profiles.get(&key.to_uppercase()).cloned()
    }

    /// Match a target code to a profile
    ///
    /// Keyword extracted from the code is matched against profile directory
    /// names first, then each profile's configured code patterns.
    pub fn match_target(&self, code: &str) -> Option<Arc<ResolvedProfile>> {
        if let Some(keyword) = extract_keyword(code) {
            if let Some(profile) = self.profiles.get(&keyword) {
                if profile.profile.enabled {
                    debug!(code, keyword = %keyword, "Matched profile by keyword");
                    return Some(profile.clone());
                }
            }
        }

        for (key, profile) in &self.profiles {
            if !profile.profile.enabled {
                continue;
            }
            for pattern in &profile.profile.match_rules.code_patterns {
                if !pattern.is_empty() && code.contains(pattern.as_str()) {
                    debug!(code, profile = %key, pattern = %pattern, "Matched profile by pattern");
                    return Some(profile.clone());
                }
            }
        }

        warn!(code, "No machine profile matched target");
        None
    }
}

/// Extract the machine-type keyword from a target code
///
/// `873-JJBX-0004` → `JJBX`. Codes without the dashed form fall back to the
/// code with leading/trailing digit runs stripped.
pub fn extract_keyword(code: &str) -> Option<String> {
    let parts: Vec<&str> = code.split('-').collect();
    if parts.len() >= 2 {
        let keyword = parts[1].trim().to_uppercase();
        if !keyword.is_empty() {
            return Some(keyword);
        }
    }

    let stripped = code
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '-')
        .trim_end_matches(|c: char| c.is_ascii_digit() || c == '-');
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_uppercase())
    }
}

fn load_audio_overrides(path: &Path) -> Result<Option<AudioOverrides>> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let overrides: AudioOverrides = serde_json::from_str(&raw).map_err(|e| {
        Error::Config(format!("invalid audio config {}: {e}", path.display()))
    })?;
    Ok(Some(overrides))
}

fn load_profile_dir(dir: &Path, shared_audio: Option<&AudioOverrides>) -> Result<ResolvedProfile> {
    let config_path = dir.join("config.json");
    let raw = std::fs::read_to_string(&config_path).map_err(|e| {
        Error::Config(format!("cannot read {}: {e}", config_path.display()))
    })?;
    let doc: ProfileDoc = serde_json::from_str(&raw).map_err(|e| {
        Error::Config(format!("invalid profile config {}: {e}", config_path.display()))
    })?;

    let dir_name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let name = doc.name.unwrap_or_else(|| dir_name.clone());

    // test_flows.json wins over flows embedded in config.json
    let flows_path = dir.join("test_flows.json");
    let stages = if flows_path.is_file() {
        let raw = std::fs::read_to_string(&flows_path)?;
        let flows: FlowsDoc = serde_json::from_str(&raw).map_err(|e| {
            Error::Config(format!("invalid test flows {}: {e}", flows_path.display()))
        })?;
        flows.test_flows
    } else {
        doc.test_flows
    };

    for stage in &stages {
        stage.validate(&name)?;
    }
    let entry_count = stages
        .iter()
        .filter(|s| s.enabled && s.kind.is_entry())
        .count();
    if entry_count > 1 {
        return Err(Error::Config(format!(
            "profile '{name}': {entry_count} entry stages configured, at most one allowed"
        )));
    }

    let mut audio = AudioThresholds::default();
    if let Some(shared) = shared_audio {
        audio = audio.merged(shared);
    }
    if let Some(own) = load_audio_overrides(&dir.join("audio_config.json"))? {
        audio = audio.merged(&own);
    }

    let profile = MachineProfile {
        name,
        description: doc.description,
        enabled: doc.enabled,
        match_rules: doc.match_rules,
        stages,
        audio,
        dir: dir.to_path_buf(),
    };

    let references = load_reference_sets(&profile)?;
    Ok(ResolvedProfile { profile, references })
}

/// Decode every reference image needed by the profile's enabled stages
fn load_reference_sets(profile: &MachineProfile) -> Result<HashMap<String, Arc<ReferenceImageSet>>> {
    let mut sets = HashMap::new();
    let base = profile.dir.join("reference_images");

    for stage in profile.stages.iter().filter(|s| s.enabled) {
        let Some(image_cfg) = stage.kind.image_config() else {
            continue;
        };
        if !image_cfg.enabled {
            continue;
        }
        let set_name = image_cfg
            .image_set
            .clone()
            .unwrap_or_else(|| stage.name.clone());
        if sets.contains_key(&set_name) {
            continue;
        }

        let set_dir = base.join(&set_name);
        let set = load_reference_set(&set_name, &set_dir)?;
        if set.is_empty() {
            return Err(Error::Config(format!(
                "profile '{}': stage '{}' enables image comparison but {} holds no reference images",
                profile.name,
                stage.name,
                set_dir.display()
            )));
        }
        sets.insert(set_name, Arc::new(set));
    }

    Ok(sets)
}

fn load_reference_set(name: &str, dir: &Path) -> Result<ReferenceImageSet> {
    let mut images = Vec::new();
    if dir.is_dir() {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()).map(str::to_lowercase),
                    Some(ref ext) if ext == "png" || ext == "jpg" || ext == "jpeg"
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let decoded = image::open(&path)
                .map_err(|e| {
                    Error::Config(format!(
                        "unreadable reference image {}: {e}",
                        path.display()
                    ))
                })?
                .to_rgba8();
            images.push((file_name, decoded));
        }
    }

    Ok(ReferenceImageSet {
        name: name.to_string(),
        images,
    })
}
