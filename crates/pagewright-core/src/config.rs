//! Engine tuning configuration.
//!
//! Values come from [`EngineConfig::default`], from a loose
//! `key:value,key:value` string (the `PAGEWRIGHT_CONF` environment variable),
//! or from any serde source such as a JSON workload file.

use serde::{Deserialize, Serialize};

use crate::error::{ExtentError, Result};
use crate::sz::{self, PAGE};

/// Environment variable read by [`EngineConfig::from_env`].
pub const CONF_ENV_VAR: &str = "PAGEWRIGHT_CONF";

/// Tuning knobs for the extent engine and the hugepage tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Keep released memory in the retained set instead of unmapping it.
    pub retain: bool,
    /// The mapping layer can split and merge mappings freely.
    pub maps_coalesce: bool,
    /// Delayed-coalesce sets skip candidates whose class exceeds
    /// `request << lg_extent_max_active_fit`.
    pub lg_extent_max_active_fit: u32,
    /// First class of the retained growth series, in pages.
    pub grow_start_pages: usize,
    /// Cap of the retained growth series, in pages.
    pub retain_grow_limit_pages: usize,
    /// Delayed-coalesce sets coalesce extents at least this large eagerly.
    pub large_coalesce_threshold: usize,
    /// Eagerly coalesced extents at least this large bypass the dirty set.
    pub oversize_threshold: usize,
    /// Hugepage size in bytes.
    pub hugepage: usize,
    /// Pageslab size in bytes.
    pub ps_goal: usize,
    /// Largest request served from pageslabs.
    pub ps_alloc_max: usize,
    /// Upper bound on live metadata records. `None` is unbounded.
    pub record_capacity: Option<usize>,
    /// Lifecycle log ring size.
    pub log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retain: true,
            maps_coalesce: true,
            lg_extent_max_active_fit: 6,
            grow_start_pages: 512,
            retain_grow_limit_pages: 1 << 24,
            large_coalesce_threshold: 4 * PAGE,
            oversize_threshold: 8 << 20,
            hugepage: 2 << 20,
            ps_goal: 2 << 20,
            ps_alloc_max: 256 << 10,
            record_capacity: None,
            log_capacity: 1024,
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(config_error(key, format!("`{raw}` is not a boolean"))),
    }
}

fn parse_size(key: &str, raw: &str) -> Result<usize> {
    let lower = raw.to_ascii_lowercase();
    let (digits, shift) = match lower.as_bytes().last() {
        Some(b'k') => (&lower[..lower.len() - 1], 10),
        Some(b'm') => (&lower[..lower.len() - 1], 20),
        Some(b'g') => (&lower[..lower.len() - 1], 30),
        _ => (lower.as_str(), 0),
    };
    let value: usize = digits
        .trim()
        .parse()
        .map_err(|_| config_error(key, format!("`{raw}` is not a size")))?;
    value
        .checked_mul(1usize << shift)
        .ok_or_else(|| config_error(key, format!("`{raw}` overflows")))
}

fn config_error(key: &str, reason: String) -> ExtentError {
    ExtentError::Config {
        key: key.to_owned(),
        reason,
    }
}

impl EngineConfig {
    /// Parses `key:value` pairs separated by commas on top of the defaults.
    /// Unknown keys are rejected.
    pub fn from_conf_str(conf: &str) -> Result<Self> {
        let mut config = Self::default();
        for pair in conf.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| config_error(pair, "expected `key:value`".to_owned()))?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "retain" => config.retain = parse_bool(key, value)?,
                "maps_coalesce" => config.maps_coalesce = parse_bool(key, value)?,
                "lg_extent_max_active_fit" => {
                    config.lg_extent_max_active_fit = value
                        .parse()
                        .map_err(|_| config_error(key, format!("`{value}` is not a shift")))?;
                }
                "grow_start_pages" => config.grow_start_pages = parse_size(key, value)?,
                "retain_grow_limit_pages" => {
                    config.retain_grow_limit_pages = parse_size(key, value)?;
                }
                "large_coalesce_threshold" => {
                    config.large_coalesce_threshold = parse_size(key, value)?;
                }
                "oversize_threshold" => config.oversize_threshold = parse_size(key, value)?,
                "hugepage" => config.hugepage = parse_size(key, value)?,
                "ps_goal" => config.ps_goal = parse_size(key, value)?,
                "ps_alloc_max" => config.ps_alloc_max = parse_size(key, value)?,
                "record_capacity" => config.record_capacity = Some(parse_size(key, value)?),
                "log_capacity" => config.log_capacity = parse_size(key, value)?,
                _ => return Err(config_error(key, "unknown key".to_owned())),
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Reads [`CONF_ENV_VAR`]; an unset or empty variable yields the defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONF_ENV_VAR) {
            Ok(raw) if !raw.trim().is_empty() => Self::from_conf_str(&raw),
            _ => Ok(Self::default()),
        }
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("hugepage", self.hugepage),
            ("ps_goal", self.ps_goal),
            ("ps_alloc_max", self.ps_alloc_max),
            ("large_coalesce_threshold", self.large_coalesce_threshold),
            ("oversize_threshold", self.oversize_threshold),
        ] {
            if !sz::is_page_multiple(value) {
                return Err(config_error(key, format!("{value} is not a page multiple")));
            }
        }
        if !self.hugepage.is_power_of_two() {
            return Err(config_error("hugepage", "must be a power of two".to_owned()));
        }
        if self.ps_alloc_max > self.ps_goal {
            return Err(config_error("ps_alloc_max", "exceeds ps_goal".to_owned()));
        }
        if self.grow_start_pages == 0 || self.grow_start_pages > self.retain_grow_limit_pages {
            return Err(config_error(
                "grow_start_pages",
                "must be nonzero and at most retain_grow_limit_pages".to_owned(),
            ));
        }
        if self.lg_extent_max_active_fit >= usize::BITS {
            return Err(config_error(
                "lg_extent_max_active_fit",
                "shift too large".to_owned(),
            ));
        }
        Ok(())
    }

    /// Growth-series class index of the first retained growth.
    #[must_use]
    pub fn grow_start_pind(&self) -> usize {
        sz::psz2ind(self.grow_start_pages.saturating_mul(PAGE)).min(self.grow_limit_pind())
    }

    /// Growth-series class index cap.
    #[must_use]
    pub fn grow_limit_pind(&self) -> usize {
        let limit = self.retain_grow_limit_pages.saturating_mul(PAGE);
        let ind = sz::psz2ind(sz::quantize_floor(sz::page_ceil(limit).min(sz::MAX_PSZ)));
        ind.min(sz::NPSIZES - 1)
    }
}
