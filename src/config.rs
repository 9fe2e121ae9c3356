//! Configuration management for tile-sched.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (TILE_SCHED_BUFFER_SLOTS, etc.)
//! 2. Project-local config file (`./tile-sched.toml`)
//! 3. User config file (`~/.config/tile-sched/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # tile-sched.toml
//!
//! # Slots per double-buffered scratchpad region
//! buffer_slots = 2
//!
//! # Results in flight between the fused producer and consumer
//! handoff_capacity = 2
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

const DEFAULT_BUFFER_SLOTS: u8 = 2;
const DEFAULT_HANDOFF_CAPACITY: usize = 2;
const DEFAULT_DMA_ALIGNMENT: u64 = 4;
const DEFAULT_GROUP_WIDTH: u32 = 16;

/// tile-sched configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Slots per double-buffered scratchpad region.
    pub buffer_slots: Option<u8>,

    /// Capacity of the fused producer/consumer handoff.
    /// Must not exceed `buffer_slots`.
    pub handoff_capacity: Option<usize>,

    /// Alignment of scratchpad slots, in bytes.
    pub dma_alignment: Option<u64>,

    /// Channels per weight group of grouped kernels, unless a plan sets its own.
    pub group_width: Option<u32>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `tile-sched.toml`
    /// 3. User config `~/.config/tile-sched/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load user config first (lowest priority of file configs)
        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        // Load project-local config (higher priority)
        if let Some(local_config) = Self::load_from_file(Path::new("tile-sched.toml")) {
            config.merge(local_config);
        }

        // Environment variables override everything
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Slots per double-buffered region, default 2.
    pub fn buffer_slots(&self) -> u8 {
        self.buffer_slots.unwrap_or(DEFAULT_BUFFER_SLOTS)
    }

    /// Fused handoff capacity, default 2.
    pub fn handoff_capacity(&self) -> usize {
        self.handoff_capacity.unwrap_or(DEFAULT_HANDOFF_CAPACITY)
    }

    /// Slot alignment in bytes, default 4.
    pub fn dma_alignment(&self) -> u64 {
        self.dma_alignment.unwrap_or(DEFAULT_DMA_ALIGNMENT)
    }

    /// Default weight group width, 16.
    pub fn group_width(&self) -> u32 {
        self.group_width.unwrap_or(DEFAULT_GROUP_WIDTH)
    }

    /// Load user configuration from ~/.config/tile-sched/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    pub fn merge(&mut self, other: Self) {
        if other.buffer_slots.is_some() {
            self.buffer_slots = other.buffer_slots;
        }
        if other.handoff_capacity.is_some() {
            self.handoff_capacity = other.handoff_capacity;
        }
        if other.dma_alignment.is_some() {
            self.dma_alignment = other.dma_alignment;
        }
        if other.group_width.is_some() {
            self.group_width = other.group_width;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(name: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.trim().parse() {
                Ok(parsed) => {
                    log::info!("Using {} from environment: {}", name, value);
                    Some(parsed)
                }
                Err(_) => {
                    log::warn!("Ignoring {}={}: not a number", name, value);
                    None
                }
            }
        }

        let var = "TILE_SCHED_BUFFER_SLOTS";
        if let Some(slots) = parse(var, lookup(var)) {
            self.buffer_slots = Some(slots);
        }
        let var = "TILE_SCHED_HANDOFF_CAPACITY";
        if let Some(capacity) = parse(var, lookup(var)) {
            self.handoff_capacity = Some(capacity);
        }
        let var = "TILE_SCHED_DMA_ALIGNMENT";
        if let Some(alignment) = parse(var, lookup(var)) {
            self.dma_alignment = Some(alignment);
        }
        let var = "TILE_SCHED_GROUP_WIDTH";
        if let Some(width) = parse(var, lookup(var)) {
            self.group_width = Some(width);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tile-sched").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# tile-sched configuration
# Place this file at ~/.config/tile-sched/config.toml or ./tile-sched.toml

# Slots per double-buffered scratchpad region (at least 2)
buffer_slots = 2

# Results in flight between the fused producer and consumer
# (at least 1, at most buffer_slots)
handoff_capacity = 2

# Scratchpad slot alignment in bytes
# dma_alignment = 4

# Channels per weight group of grouped kernels
# group_width = 16
"#
        .to_string()
    }
}
