//! Group mapping metadata.
//!
//! A mapping file `<dir>/<group>.toml` lists the parameters of one group:
//!
//! ```toml
//! [[param]]
//! key = "A0"
//! name = "Throttle min"
//! unit = "us"
//! min = 900
//! max = 1200
//! precision = 0
//! ```

use std::cmp::Ordering;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigError;
use crate::protocol::constants::DEFAULT_PRECISION;

fn default_precision() -> u32 {
    DEFAULT_PRECISION
}

/// Metadata of one device parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default = "default_precision")]
    pub precision: u32,
    #[serde(default)]
    pub default: Option<f64>,
}

impl ParamDescriptor {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: String::new(),
            unit: String::new(),
            description: String::new(),
            min: None,
            max: None,
            precision: DEFAULT_PRECISION,
            default: None,
        }
    }

    pub fn with_bounds(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_precision(mut self, precision: u32) -> Self {
        self.precision = precision;
        self
    }

    /// Inclusive bounds check; a missing bound is unconstrained.
    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

#[derive(Debug, Default, Deserialize)]
struct MappingFile {
    #[serde(default)]
    param: Vec<ParamDescriptor>,
}

/// Numeric suffix of a key such as `A10`.
fn key_index(key: &str) -> Option<u64> {
    let mut chars = key.chars();
    chars.next()?;
    chars.as_str().parse().ok()
}

/// Order keys by numeric suffix (`A2 < A10`); non-numeric keys sort last,
/// lexically.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    match (key_index(a), key_index(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Ordered parameter metadata for one group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupMapping {
    group: String,
    params: Vec<ParamDescriptor>,
}

impl GroupMapping {
    pub fn new(group: impl Into<String>, mut params: Vec<ParamDescriptor>) -> Self {
        params.sort_by(|a, b| compare_keys(&a.key, &b.key));
        Self {
            group: group.into(),
            params,
        }
    }

    /// A mapping with no metadata; every key is unconstrained.
    pub fn empty(group: impl Into<String>) -> Self {
        Self::new(group, Vec::new())
    }

    /// Parse mapping TOML for `group`.
    pub fn from_toml_str(group: &str, content: &str) -> Result<Self, ConfigError> {
        let file: MappingFile = toml::from_str(content)?;
        Ok(Self::new(group, file.param))
    }

    /// Load `<dir>/<group>.toml`. A missing file yields an empty mapping.
    pub fn load<P: AsRef<Path>>(dir: P, group: &str) -> Result<Self, ConfigError> {
        let path = dir.as_ref().join(format!("{}.toml", group));
        if !path.exists() {
            debug!(path = %path.display(), "No mapping file, group is unconstrained");
            return Ok(Self::empty(group));
        }
        let content = std::fs::read_to_string(&path)?;
        let mapping = Self::from_toml_str(group, &content)?;
        debug!(group, params = mapping.len(), "Loaded group mapping");
        Ok(mapping)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn params(&self) -> &[ParamDescriptor] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ParamDescriptor> {
        self.params.iter().find(|p| p.key == key)
    }
}
