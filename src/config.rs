//! Chainloader configuration
//!
//! Settings normally come from the boot environment of the host loader:
//!
//! - `debug` - a comma or space separated list of facilities; `chain` or
//!   `all` turns on debug logging
//! - `chain_debug_secureboot` - force the validated path even when secure
//!   boot is off (`1`, `true`, `yes`, `on`)
//! - `chain_max_image_size` - largest file accepted, decimal or `0x` hex

use log::LevelFilter;

/// Default limit on the size of a chained file (256 MiB)
pub const DEFAULT_MAX_IMAGE_SIZE: u64 = 256 * 1024 * 1024;

/// Chainloader configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainloadConfig {
    /// Always lay out and relocate the image ourselves
    pub debug_secure_boot: bool,
    /// Maximum log level
    pub log_level: LevelFilter,
    /// Reject files larger than this
    pub max_image_size: u64,
    /// Pick the matching slice out of fat EFI binaries
    pub universal_binaries: bool,
}

impl Default for ChainloadConfig {
    fn default() -> Self {
        ChainloadConfig {
            debug_secure_boot: false,
            log_level: LevelFilter::Info,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
            universal_binaries: cfg!(any(target_arch = "x86_64", target_arch = "x86")),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

impl ChainloadConfig {
    /// Build a configuration from environment variables
    ///
    /// `lookup` returns the value of a variable, or `None` when unset.
    /// Unparseable values are ignored with a warning.
    pub fn from_env<'a, F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let mut config = Self::default();

        if let Some(debug) = lookup("debug") {
            let enabled = debug
                .split([',', ' '])
                .any(|facility| facility == "chain" || facility == "all");
            if enabled {
                config.log_level = LevelFilter::Debug;
            }
        }

        if let Some(value) = lookup("chain_debug_secureboot") {
            match parse_bool(value) {
                Some(flag) => config.debug_secure_boot = flag,
                None => log::warn!("Chainload: Ignoring chain_debug_secureboot={:?}", value),
            }
        }

        if let Some(value) = lookup("chain_max_image_size") {
            match parse_size(value) {
                Some(size) if size > 0 => config.max_image_size = size,
                _ => log::warn!("Chainload: Ignoring chain_max_image_size={:?}", value),
            }
        }

        config
    }
}
