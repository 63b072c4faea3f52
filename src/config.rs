//! # Database Configuration
//!
//! A small typed registry of runtime-tunable keys. Every key is a `u64` with
//! a closed range; `config set` validates the key name and range *before*
//! staging a change, so commit never sees an invalid value.
//!
//! Unknown keys are rejected on writes and silently omitted on reads: a
//! client asking for keys this server version doesn't know simply gets fewer
//! entries back.

use std::collections::BTreeMap;

// =============================================================================
// Key Registry
// =============================================================================

/// Static description of one config key.
#[derive(Debug, Clone, Copy)]
pub struct ConfigKeySpec {
    /// Wire name of the key.
    pub name: &'static str,
    /// Default value when never set.
    pub default: u64,
    /// Smallest accepted value.
    pub min: u64,
    /// Largest accepted value.
    pub max: u64,
}

/// Every key this server recognizes.
///
/// The registry is the single source of truth: parsing, range checks and
/// `config get` all read from it.
pub const CONFIG_KEYS: &[ConfigKeySpec] = &[
    ConfigKeySpec {
        name: "database_workers",
        default: 4,
        min: 1,
        max: 256,
    },
    ConfigKeySpec {
        name: "max_mem",
        default: 2 * 1024 * 1024 * 1024,
        min: 16 * 1024 * 1024,
        max: 1 << 40,
    },
    ConfigKeySpec {
        name: "merge_max_datasets",
        default: 10,
        min: 2,
        max: 1024,
    },
    ConfigKeySpec {
        name: "merge_max_files",
        default: 2_000_000,
        min: 16,
        max: 1 << 32,
    },
    ConfigKeySpec {
        name: "query_max_ngram",
        default: 16,
        min: 3,
        max: 64,
    },
];

/// A validated reference to a registered config key.
#[derive(Debug, Clone, Copy)]
pub struct ConfigKey(&'static ConfigKeySpec);

impl ConfigKey {
    /// Looks a key up by wire name. `None` means the name is unrecognized.
    pub fn parse(name: &str) -> Option<Self> {
        CONFIG_KEYS.iter().find(|spec| spec.name == name).map(Self)
    }

    /// The key's wire name.
    pub fn name(&self) -> &'static str {
        self.0.name
    }

    /// Whether `value` falls inside the key's closed range.
    pub fn accepts(&self, value: u64) -> bool {
        value >= self.0.min && value <= self.0.max
    }

    /// The key's default value.
    pub fn default_value(&self) -> u64 {
        self.0.default
    }
}

// =============================================================================
// Config Store
// =============================================================================

/// Current configuration values.
///
/// Cloned wholesale into every snapshot; mutation happens only at task
/// commit through [`DatabaseConfig::set`].
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    overrides: BTreeMap<&'static str, u64>,
}

impl DatabaseConfig {
    /// Creates a config with every key at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads one key (its default if never set).
    pub fn get(&self, key: ConfigKey) -> u64 {
        self.overrides
            .get(key.name())
            .copied()
            .unwrap_or_else(|| key.default_value())
    }

    /// Reads every key as a name → value map, in name order.
    pub fn get_all(&self) -> BTreeMap<String, u64> {
        CONFIG_KEYS
            .iter()
            .map(|spec| {
                let key = ConfigKey(spec);
                (spec.name.to_string(), self.get(key))
            })
            .collect()
    }

    /// Whether the key would accept this value.
    pub fn can_set(&self, key: ConfigKey, value: u64) -> bool {
        key.accepts(value)
    }

    /// Sets a key. Callers validate with [`DatabaseConfig::can_set`] first;
    /// out-of-range values are ignored here rather than applied.
    pub fn set(&mut self, name: &str, value: u64) {
        if let Some(key) = ConfigKey::parse(name) {
            if key.accepts(value) {
                self.overrides.insert(key.name(), value);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
