use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ShelveError, ShelveResult};
use crate::name::{self, DEFAULT_NAME_PATTERN};

/// Default interval between scheduled attempts, in minutes.
pub const DEFAULT_INTERVAL_MINUTES: f64 = 5.0;

/// Engine options, as supplied by the options source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    /// Shelveset name pattern (see [`crate::name`])
    pub name_pattern: String,

    /// Shelvesets to keep; 0 disables retention
    pub maximum_shelvesets: u16,

    /// Minutes between scheduled attempts
    pub interval_minutes: f64,

    /// Stop the schedule while a debugger session is running
    pub pause_on_debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name_pattern: DEFAULT_NAME_PATTERN.to_string(),
            maximum_shelvesets: 0,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            pause_on_debug: false,
        }
    }
}

impl EngineConfig {
    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> ShelveResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShelveError::Io(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse options from JSON. Missing fields take their defaults.
    pub fn from_json(content: &str) -> ShelveResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Reject intervals the schedule cannot be armed with.
    pub fn validate(&self) -> ShelveResult<()> {
        interval_duration(self.interval_minutes).map(|_| ())
    }

    /// Copy of these options with the name pattern sanitized.
    pub fn sanitized(&self) -> Self {
        Self {
            name_pattern: name::sanitize_pattern(&self.name_pattern),
            ..self.clone()
        }
    }

    /// Retention in effect: 0 unless the pattern is timestamped.
    pub fn effective_maximum(&self) -> u16 {
        if name::is_timestamped(&self.name_pattern) {
            self.maximum_shelvesets
        } else {
            0
        }
    }

    /// Scheduling interval as a [`Duration`].
    pub fn interval(&self) -> ShelveResult<Duration> {
        interval_duration(self.interval_minutes)
    }
}

/// Convert an interval in minutes to a [`Duration`], rejecting non-positive
/// and non-finite values.
pub fn interval_duration(minutes: f64) -> ShelveResult<Duration> {
    if !minutes.is_finite() || minutes <= 0.0 {
        return Err(ShelveError::InvalidArgument(format!(
            "interval must be a positive number of minutes, got {}",
            minutes
        )));
    }
    Duration::try_from_secs_f64(minutes * 60.0).map_err(|e| {
        ShelveError::InvalidArgument(format!("interval of {} minutes: {}", minutes, e))
    })
}
