//! Runner configuration
//!
//! A single TOML file configures the run; the targets file and profile
//! directories it points at follow the on-disk layout described in
//! `machqa_common::profile`.

use crate::driver::BrowserSettings;
use machqa_common::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level runner configuration (`machqa.toml`)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Number of parallel workers, each owning one browser session
    pub workers: usize,
    /// File with one target machine code per line
    pub targets_file: PathBuf,
    /// Root directory holding one profile directory per machine type
    pub profiles_dir: PathBuf,
    /// Webhook for session reports; empty disables notifications
    pub webhook_url: Option<String>,
    /// Seconds between starting consecutive workers
    pub worker_stagger_secs: f64,
    pub browser: BrowserSettings,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            targets_file: PathBuf::from("targets.csv"),
            profiles_dir: PathBuf::from("machine_profiles"),
            webhook_url: None,
            worker_stagger_secs: 1.5,
            browser: BrowserSettings::default(),
        }
    }
}

impl RunnerConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: RunnerConfig = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        info!(
            workers = config.workers,
            targets = %config.targets_file.display(),
            profiles = %config.profiles_dir.display(),
            "Loaded runner configuration"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if !self.browser.url_template.contains("{code}") {
            return Err(Error::Config(
                "browser.url_template must contain a {code} placeholder".to_string(),
            ));
        }
        Ok(())
    }

    /// Read the ordered target code list
    ///
    /// One code per line; a `game_title_code` header line, blank lines and
    /// `#` comments are skipped.
    pub fn load_targets(&self) -> Result<Vec<String>> {
        let raw = std::fs::read_to_string(&self.targets_file).map_err(|e| {
            Error::Config(format!(
                "cannot read targets file {}: {e}",
                self.targets_file.display()
            ))
        })?;

        let codes: Vec<String> = raw
            .lines()
            .map(str::trim)
            .filter(|line| {
                !line.is_empty()
                    && !line.starts_with('#')
                    && !line.eq_ignore_ascii_case("game_title_code")
            })
            .map(str::to_string)
            .collect();

        info!(
            count = codes.len(),
            file = %self.targets_file.display(),
            "Loaded target codes"
        );
        Ok(codes)
    }
}
