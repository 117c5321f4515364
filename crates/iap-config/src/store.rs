//! Typed runtime configuration read from the merged config JSON.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;

pub const DEFAULT_DOWNLOADS_DIR_NAME: &str = "Downloads";
pub const DEFAULT_FAULT_LOG_CAPACITY: usize = 256;
const DEFAULT_LOG_FILTER: &str = "info";

/// Everything the runtime needs to wire the reconciliation engine.
///
/// ```yaml
/// store:
///   support_dir: "/var/lib/app/support"   # required
///   downloads_dir_name: "Downloads"       # optional
///   exclude_from_backup: true             # optional
///   fault_log_capacity: 256               # optional
/// catalog:
///   product_ids: ["com.example.gold", "com.example.levels"]
/// logging:
///   filter: "info,iap_reconcile=debug"
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Application-private, non-user-visible support area.
    pub support_dir: PathBuf,
    /// Name of the installed-content directory under `support_dir`.
    pub downloads_dir_name: String,
    /// Mark the installed-content directory excluded from device backup.
    pub exclude_from_backup: bool,
    /// Maximum number of reconciliation faults retained for diagnostics.
    pub fault_log_capacity: usize,
    /// Product identifiers the app asks the catalog about.
    pub product_ids: Vec<String>,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl StoreConfig {
    /// Build with defaults for everything except the support directory.
    pub fn new(support_dir: impl Into<PathBuf>) -> Self {
        Self {
            support_dir: support_dir.into(),
            downloads_dir_name: DEFAULT_DOWNLOADS_DIR_NAME.to_string(),
            exclude_from_backup: true,
            fault_log_capacity: DEFAULT_FAULT_LOG_CAPACITY,
            product_ids: Vec::new(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }

    pub fn from_json(config: &Value) -> Result<Self> {
        let support_dir = read_str_at(config, "/store/support_dir")
            .context("CONFIG_MISSING: /store/support_dir is required")?;

        let mut cfg = Self::new(support_dir);

        if let Some(name) = read_str_at(config, "/store/downloads_dir_name") {
            if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
                bail!("CONFIG_INVALID: /store/downloads_dir_name must be a single path component, got {name:?}");
            }
            cfg.downloads_dir_name = name;
        }

        if let Some(v) = config.pointer("/store/exclude_from_backup") {
            cfg.exclude_from_backup = v
                .as_bool()
                .context("CONFIG_INVALID: /store/exclude_from_backup must be a bool")?;
        }

        if let Some(v) = config.pointer("/store/fault_log_capacity") {
            let n = v
                .as_u64()
                .context("CONFIG_INVALID: /store/fault_log_capacity must be a non-negative integer")?;
            cfg.fault_log_capacity = usize::try_from(n)
                .context("CONFIG_INVALID: /store/fault_log_capacity out of range")?;
        }

        if let Some(v) = config.pointer("/catalog/product_ids") {
            let arr = v
                .as_array()
                .context("CONFIG_INVALID: /catalog/product_ids must be a list")?;
            let mut ids = Vec::with_capacity(arr.len());
            for (i, item) in arr.iter().enumerate() {
                let id = item
                    .as_str()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .with_context(|| {
                        format!("CONFIG_INVALID: /catalog/product_ids/{i} must be a non-empty string")
                    })?;
                ids.push(id.to_string());
            }
            cfg.product_ids = ids;
        }

        if let Some(filter) = read_str_at(config, "/logging/filter") {
            cfg.log_filter = filter;
        }

        Ok(cfg)
    }

    /// Destination for installed content: `support_dir/downloads_dir_name`.
    pub fn downloads_dir(&self) -> PathBuf {
        self.support_dir.join(&self.downloads_dir_name)
    }

    pub fn support_dir(&self) -> &Path {
        &self.support_dir
    }
}

/// Read a non-empty string value at `pointer`.
fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply_when_optional_keys_absent() {
        let cfg = StoreConfig::from_json(&json!({"store": {"support_dir": "/srv/app"}})).unwrap();
        assert_eq!(cfg.downloads_dir(), PathBuf::from("/srv/app/Downloads"));
        assert!(cfg.exclude_from_backup);
        assert_eq!(cfg.fault_log_capacity, DEFAULT_FAULT_LOG_CAPACITY);
        assert!(cfg.product_ids.is_empty());
        assert_eq!(cfg.log_filter, "info");
    }

    #[test]
    fn missing_support_dir_is_an_error() {
        let err = StoreConfig::from_json(&json!({"store": {}})).unwrap_err();
        assert!(err.to_string().contains("CONFIG_MISSING"));
    }

    #[test]
    fn downloads_dir_name_must_be_single_component() {
        let err = StoreConfig::from_json(&json!({
            "store": {"support_dir": "/srv", "downloads_dir_name": "../escape"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("CONFIG_INVALID"));
    }

    #[test]
    fn product_ids_must_be_strings() {
        let err = StoreConfig::from_json(&json!({
            "store": {"support_dir": "/srv"},
            "catalog": {"product_ids": ["gold", 7]}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("/catalog/product_ids/1"));
    }
}
