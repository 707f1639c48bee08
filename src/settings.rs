use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::canvas::HexColor;

/// Error type for settings file operations
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Could not serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Editor tunables that persist across sessions.
///
/// Every field falls back to its default when absent from the file, so an
/// old settings file keeps loading after new knobs are added.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorSettings {
    /// Cells per side of the paintable grid
    pub grid_size: u32,
    pub min_zoom: f64,
    pub max_zoom: f64,
    /// Fraction of the viewport left empty around the mask by fit-to-view
    pub fit_padding: f64,
    /// Multiplicative factor for one zoom-in / zoom-out step
    pub zoom_step: f64,
    /// Maximum number of undo checkpoints
    pub history_limit: usize,
    /// Maximum cells visited by a single flood fill
    pub flood_fill_budget: usize,
    /// Delta saves are only attempted below this many changed cells...
    pub delta_max_cells: usize,
    /// ...and below this fraction of the whole grid.
    pub delta_max_ratio: f64,
    pub save_debounce_ms: u64,
    pub session_snapshot_interval_ms: u64,
    /// Extra attempts after the first failed remote write
    pub remote_retries: u32,
    pub retry_backoff_ms: u64,
    /// Failed cache initialisations before the cache disables itself
    pub cache_init_attempts: u32,
    pub cache_disable_cooldown_ms: u64,
    pub cache_ttl_ms: u64,
    pub stamp_alpha_threshold: u8,
    /// Checkerboard square size in world cells (1.0 alternates every cell)
    pub checker_size: f64,
    pub default_color: HexColor,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            grid_size: 100,
            min_zoom: 0.25,
            max_zoom: 64.0,
            fit_padding: 0.1,
            zoom_step: 1.2,
            history_limit: 50,
            flood_fill_budget: 5_000,
            delta_max_cells: 500,
            delta_max_ratio: 0.25,
            save_debounce_ms: 2_000,
            session_snapshot_interval_ms: 5_000,
            remote_retries: 2,
            retry_backoff_ms: 250,
            cache_init_attempts: 2,
            cache_disable_cooldown_ms: 10 * 60 * 1000,
            cache_ttl_ms: 24 * 60 * 60 * 1000,
            stamp_alpha_threshold: 128,
            checker_size: 1.0,
            default_color: HexColor::BLACK,
        }
    }
}

impl EditorSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/terrapaint/settings.toml  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\terrapaint\settings.toml
    /// On macOS:   ~/Library/Application Support/terrapaint/settings.toml
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .ok()?;
            return Some(PathBuf::from(appdata).join("terrapaint").join("settings.toml"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("terrapaint")
                    .join("settings.toml"),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
                .ok()?;
            Some(config_dir.join("terrapaint").join("settings.toml"))
        }
    }

    /// Load settings from `path`. A missing file yields defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let mut settings: Self = toml::from_str(&content)?;
        settings.validate();
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Clamp values that would break the engine back into a usable range.
    pub fn validate(&mut self) {
        let defaults = Self::default();
        if self.grid_size == 0 {
            warn!("settings: grid_size 0 is invalid, using {}", defaults.grid_size);
            self.grid_size = defaults.grid_size;
        }
        if !(self.min_zoom > 0.0) || !(self.max_zoom >= self.min_zoom) {
            warn!(
                "settings: zoom range [{}, {}] is invalid, using [{}, {}]",
                self.min_zoom, self.max_zoom, defaults.min_zoom, defaults.max_zoom
            );
            self.min_zoom = defaults.min_zoom;
            self.max_zoom = defaults.max_zoom;
        }
        if !(0.0..0.5).contains(&self.fit_padding) {
            warn!("settings: fit_padding {} out of range", self.fit_padding);
            self.fit_padding = defaults.fit_padding;
        }
        if !(self.zoom_step > 1.0) {
            warn!("settings: zoom_step {} must exceed 1", self.zoom_step);
            self.zoom_step = defaults.zoom_step;
        }
        if self.history_limit == 0 {
            warn!("settings: history_limit 0 is invalid");
            self.history_limit = 1;
        }
        if !(self.delta_max_ratio > 0.0 && self.delta_max_ratio <= 1.0) {
            warn!("settings: delta_max_ratio {} out of (0, 1]", self.delta_max_ratio);
            self.delta_max_ratio = defaults.delta_max_ratio;
        }
        if self.cache_init_attempts == 0 {
            self.cache_init_attempts = 1;
        }
        if !(self.checker_size > 0.0) {
            self.checker_size = defaults.checker_size;
        }
    }

    /// Total number of cells in the grid.
    pub fn cell_count(&self) -> usize {
        (self.grid_size as usize) * (self.grid_size as usize)
    }
}
