//! # fanout-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`FanoutSettings::default()`]
//! 2. **User file**: `~/.fanout/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `FANOUT_*` overrides (highest priority)
//!
//! There is no global instance: the binary loads settings once and hands
//! the relevant section to each component, so several balancers or pools
//! with different settings can coexist in one process.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, load_with_env, settings_path};
pub use types::*;
