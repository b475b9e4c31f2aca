//! Runtime configuration consumed by the control core.
//!
//! The surrounding UI owns the persisted JSON document; the core reads
//! the sections that affect its behaviour: capability overrides per
//! printer, AMS mock mode, streaming budgets, file-modifier settings,
//! and transport timing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::capabilities::{Capability, CapabilityState};
use crate::error::{Error, Result};

/// Transport timing and reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Default per-request timeout in milliseconds
    pub default_timeout_ms: u64,
    /// Base reconnect delay in milliseconds
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap in milliseconds
    pub reconnect_max_ms: u64,
    /// Maximum reconnect attempts; 0 means retry forever
    pub reconnect_max_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_max_attempts: 0,
        }
    }
}

/// Streaming engine budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Layer cache budget in bytes
    pub cache_budget_bytes: usize,
    /// Layers to prefetch on each side of a request
    pub prefetch_count: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            // Sized for 47MB-class boards with room for the UI.
            cache_budget_bytes: 4 * 1024 * 1024,
            prefetch_count: 2,
        }
    }
}

/// File modifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModifierConfig {
    /// Hidden subdirectory of the host's gcodes root for temp copies
    pub temp_dir: String,
    /// Prefix planted in front of skipped lines
    pub skip_prefix: String,
    /// Whether to prepend a header comment describing the amendments
    pub add_header_comment: bool,
}

impl Default for ModifierConfig {
    fn default() -> Self {
        Self {
            temp_dir: ".helix_temp".to_string(),
            skip_prefix: "; HELIX_SKIP: ".to_string(),
            add_header_comment: true,
        }
    }
}

/// Per-printer configuration section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// Capability override states, keyed by capability name
    pub capability_overrides: HashMap<String, CapabilityState>,
}

/// Root runtime configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Per-printer sections, keyed by printer name
    pub printers: HashMap<String, PrinterConfig>,
    /// Run AMS against the internal simulator instead of real hardware
    pub ams_mock_mode: bool,
    /// Color magnitude above which the tracked LED counts as on
    pub led_on_threshold: f64,
    /// Streaming engine budgets
    pub streaming: StreamingConfig,
    /// File modifier settings
    pub modifier: ModifierConfig,
    /// Transport timing
    pub transport: TransportConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            printers: HashMap::new(),
            ams_mock_mode: false,
            led_on_threshold: 0.001,
            streaming: StreamingConfig::default(),
            modifier: ModifierConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration document from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: RuntimeConfig = serde_json::from_str(text)
            .map_err(|e| Error::InvalidArgument(format!("bad config document: {e}")))?;
        if config.led_on_threshold <= 0.0 {
            config.led_on_threshold = 0.001;
        }
        Ok(config)
    }

    /// Capability override map for one printer
    ///
    /// Unknown capability names in the document are ignored with a
    /// warning; absent printers yield an empty (all-Auto) map.
    pub fn capability_overrides(&self, printer: &str) -> HashMap<Capability, CapabilityState> {
        let mut result = HashMap::new();
        let Some(section) = self.printers.get(printer) else {
            return result;
        };
        for (name, state) in &section.capability_overrides {
            match Capability::ALL.iter().find(|c| c.name() == name) {
                Some(cap) => {
                    result.insert(*cap, *state);
                }
                None => tracing::warn!("Unknown capability override '{}'", name),
            }
        }
        result
    }
}

/// Whether the filament-runout UI is forced on even with an AMS present
///
/// Reads `HELIX_FORCE_RUNOUT_MODAL`; any non-empty value other than "0"
/// counts as set.
pub fn force_runout_modal() -> bool {
    std::env::var("HELIX_FORCE_RUNOUT_MODAL")
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.modifier.temp_dir, ".helix_temp");
        assert_eq!(config.modifier.skip_prefix, "; HELIX_SKIP: ");
        assert_eq!(config.transport.reconnect_max_attempts, 0);
        assert!(!config.ams_mock_mode);
    }

    #[test]
    fn test_capability_overrides_pointer() {
        let doc = r#"{
            "printers": {
                "voron": {
                    "capability_overrides": {
                        "bed_mesh": "disable",
                        "probe": "enable",
                        "led": "auto",
                        "warp_drive": "enable"
                    }
                }
            }
        }"#;
        let config = RuntimeConfig::from_json(doc).unwrap();
        let overrides = config.capability_overrides("voron");
        assert_eq!(
            overrides.get(&Capability::BedMesh),
            Some(&CapabilityState::Disable)
        );
        assert_eq!(
            overrides.get(&Capability::Probe),
            Some(&CapabilityState::Enable)
        );
        assert_eq!(
            overrides.get(&Capability::Led),
            Some(&CapabilityState::Auto)
        );
        // Unknown names are dropped, not errors.
        assert_eq!(overrides.len(), 3);
        // Unknown printers yield empty maps.
        assert!(config.capability_overrides("other").is_empty());
    }

    #[test]
    fn test_led_threshold_sanitized() {
        let config = RuntimeConfig::from_json(r#"{"led_on_threshold": -1.0}"#).unwrap();
        assert!(config.led_on_threshold > 0.0);
    }
}
