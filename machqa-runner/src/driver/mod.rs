//! UI-automation driver boundary
//!
//! The flow engine drives a browser session only through [`UiDriver`].
//! Every operation fails with a [`DriverError`] that the engine counts as
//! one failed stage attempt; nothing here aborts a session by itself.
//!
//! Audio flows as message passing: the driver pushes bounded
//! [`AudioChunk`]s over an mpsc channel and the detector drains it. The
//! detector never calls back into the browser context.

use async_trait::async_trait;
use image::RgbaImage;
use machqa_common::profile::CaptureScope;
use machqa_common::report::{ConsoleError, TargetTask};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod chrome;

pub use chrome::{BrowserSettings, ChromeDriver};

/// Driver-level failures, mapped onto stage attempts by the flow engine
#[derive(Debug, Error)]
pub enum DriverError {
    /// Frame or audio capture failed or produced undecodable data
    #[error("capture failed: {0}")]
    Capture(String),

    /// A UI action (navigate/click) failed
    #[error("action failed: {0}")]
    Action(String),
}

/// Bounded block of per-channel audio samples pushed by the driver
#[derive(Debug, Clone, Default)]
pub struct AudioChunk {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn sample_count(&self) -> usize {
        self.left.len() + self.right.len()
    }
}

/// Where a click lands: a CSS selector or a page coordinate
#[derive(Debug, Clone, PartialEq)]
pub enum ClickTarget {
    Selector(String),
    Position { x: f64, y: f64 },
}

impl ClickTarget {
    /// Interpret a configured string: `"320,480"` is a coordinate pair,
    /// anything else is a CSS selector
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split(',').map(str::trim);
        if let (Some(x), Some(y), None) = (parts.next(), parts.next(), parts.next()) {
            if let (Ok(x), Ok(y)) = (x.parse::<f64>(), y.parse::<f64>()) {
                return ClickTarget::Position { x, y };
            }
        }
        ClickTarget::Selector(raw.to_string())
    }
}

/// One browser session's automation surface
#[async_trait]
pub trait UiDriver: Send + Sync {
    /// Navigate the session to the given target machine
    async fn navigate(&self, task: &TargetTask) -> Result<(), DriverError>;

    /// Capture a raster frame of the requested scope
    async fn capture_frame(&self, scope: &CaptureScope) -> Result<RgbaImage, DriverError>;

    /// Start an audio capture of roughly `duration`; chunks arrive on the
    /// returned channel and the channel closes when the capture ends
    async fn capture_audio(
        &self,
        duration: Duration,
    ) -> Result<mpsc::Receiver<AudioChunk>, DriverError>;

    /// Perform a click on the given target
    async fn perform_click(&self, target: &ClickTarget) -> Result<(), DriverError>;

    /// Console/page errors collected since the last drain
    async fn drain_console_errors(&self) -> Vec<ConsoleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_coordinate_pairs_as_positions() {
        assert_eq!(
            ClickTarget::parse("320, 480"),
            ClickTarget::Position { x: 320.0, y: 480.0 }
        );
    }

    #[test]
    fn parses_everything_else_as_selectors() {
        assert_eq!(
            ClickTarget::parse("button.spin"),
            ClickTarget::Selector("button.spin".to_string())
        );
        // three comma fields is not a coordinate pair
        assert_eq!(
            ClickTarget::parse("1,2,3"),
            ClickTarget::Selector("1,2,3".to_string())
        );
    }
}
