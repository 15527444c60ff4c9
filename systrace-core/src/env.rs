//! Component A — Env & Rank Config.
//!
//! Ports `original_source`'s `EnvVarRegistry`/`setUpGlobalConfig()`: a
//! validated registry of environment-variable names with typed defaults,
//! consulted through a three-tier fallback (env → config file → registered
//! default → type default), followed by the device probe that decides
//! whether tracing is actually enabled for this rank.

use std::collections::HashMap;
use std::path::Path;

use systrace_common::RankCtx;

use crate::error::EnvParseError;

const STRING_DEFAULT_VALUE: &str = "NOT_SET";
const INT_DEFAULT_VALUE: i64 = 0;
const BOOL_DEFAULT_VALUE: bool = false;

#[derive(Debug, Clone)]
enum Default_ {
    Int(i64),
    Bool(bool),
    Str(String),
}

/// Validated `(name, typed default)` store plus an optional config-file
/// fallback tier, read through [`EnvRegistry::get_int`]/`get_bool`/
/// `get_string`.
pub struct EnvRegistry {
    defaults: HashMap<String, Default_>,
    config_file: Option<toml::Value>,
}

fn validate_name(name: &str) -> Result<(), EnvParseError> {
    let mut chars = name.chars();
    let ok_first = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let ok_rest = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if name.is_empty() || !ok_first || !ok_rest {
        return Err(EnvParseError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl EnvRegistry {
    pub fn new() -> Self {
        Self {
            defaults: HashMap::new(),
            config_file: None,
        }
    }

    /// Register the stable contract from spec.md §4.A plus the
    /// original-source-derived additions in SPEC_FULL.md §4.A. Panics on an
    /// invalid name — this is a fixed, one-time call at process init, so an
    /// invalid name here is a programmer error, never a runtime condition.
    pub fn register_all() -> Self {
        let mut reg = Self::new();
        reg.register_int("RANK", 0).unwrap();
        reg.register_int("WORLD_SIZE", 1).unwrap();
        reg.register_int("LOCAL_RANK", 0).unwrap();
        reg.register_int("LOCAL_WORLD_SIZE", 1).unwrap();
        reg.register_bool("SYSTRACE_DEBUG_MODE", false).unwrap();
        reg.register_bool("SYSTRACE_LOGGING_APPEND", false).unwrap();
        reg.register_str("SYSTRACE_LOGGING_DIR", STRING_DEFAULT_VALUE).unwrap();
        reg.register_str("SYSTRACE_HOST_TRACING_FUNC", STRING_DEFAULT_VALUE)
            .unwrap();
        reg.register_str("SYSTRACE_SYMS_FILE", STRING_DEFAULT_VALUE).unwrap();
        reg.register_str("SYSTRACE_DEVICE_PREFIX", "davinci").unwrap();
        reg.register_str("METRIC_PATH", systrace_common::DEFAULT_METRIC_PATH)
            .unwrap();
        reg.register_str("ENV_ARGO_WORKFLOW_NAME", "").unwrap();

        if let Ok(path) = std::env::var("SYSTRACE_CONFIG_FILE") {
            reg.load_config_file(Path::new(&path));
        }
        reg
    }

    pub fn register_int(&mut self, name: &str, default: i64) -> Result<(), EnvParseError> {
        validate_name(name)?;
        self.defaults.insert(name.to_string(), Default_::Int(default));
        Ok(())
    }

    pub fn register_bool(&mut self, name: &str, default: bool) -> Result<(), EnvParseError> {
        validate_name(name)?;
        self.defaults.insert(name.to_string(), Default_::Bool(default));
        Ok(())
    }

    pub fn register_str(&mut self, name: &str, default: &str) -> Result<(), EnvParseError> {
        validate_name(name)?;
        self.defaults
            .insert(name.to_string(), Default_::Str(default.to_string()));
        Ok(())
    }

    fn load_config_file(&mut self, path: &Path) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match contents.parse::<toml::Value>() {
                Ok(v) => self.config_file = Some(v),
                Err(e) => log::warn!("SYSTRACE_CONFIG_FILE {path:?} failed to parse: {e}"),
            },
            Err(e) => log::warn!("SYSTRACE_CONFIG_FILE {path:?} unreadable: {e}"),
        }
    }

    pub fn get_int(&self, name: &str) -> i64 {
        if let Ok(raw) = std::env::var(name) {
            match raw.parse::<i64>() {
                Ok(v) => return v,
                Err(_) => log::warn!("env var {name}='{raw}' is not a valid int, falling through"),
            }
        }
        if let Some(v) = self.config_file.as_ref().and_then(|t| t.get(name)).and_then(|v| v.as_integer()) {
            return v;
        }
        match self.defaults.get(name) {
            Some(Default_::Int(v)) => *v,
            Some(_) => {
                log::warn!("env var {name} registered with a non-int default, using type default");
                INT_DEFAULT_VALUE
            }
            None => INT_DEFAULT_VALUE,
        }
    }

    pub fn get_bool(&self, name: &str) -> bool {
        if let Ok(raw) = std::env::var(name) {
            match raw.as_str() {
                "1" | "true" | "TRUE" | "True" => return true,
                "0" | "false" | "FALSE" | "False" => return false,
                _ => log::warn!("env var {name}='{raw}' is not a valid bool, falling through"),
            }
        }
        if let Some(v) = self.config_file.as_ref().and_then(|t| t.get(name)).and_then(|v| v.as_bool()) {
            return v;
        }
        match self.defaults.get(name) {
            Some(Default_::Bool(v)) => *v,
            Some(_) => {
                log::warn!("env var {name} registered with a non-bool default, using type default");
                BOOL_DEFAULT_VALUE
            }
            None => BOOL_DEFAULT_VALUE,
        }
    }

    pub fn get_string(&self, name: &str) -> String {
        if let Ok(raw) = std::env::var(name) {
            return raw;
        }
        if let Some(v) = self.config_file.as_ref().and_then(|t| t.get(name)).and_then(|v| v.as_str()) {
            return v.to_string();
        }
        match self.defaults.get(name) {
            Some(Default_::Str(v)) => v.clone(),
            Some(_) => {
                log::warn!("env var {name} registered with a non-string default, using type default");
                STRING_DEFAULT_VALUE.to_string()
            }
            None => STRING_DEFAULT_VALUE.to_string(),
        }
    }
}

impl Default for EnvRegistry {
    fn default() -> Self {
        Self::register_all()
    }
}

/// Probe `/dev/<prefix>{0..16}` and build the immutable rank context,
/// mirroring `setUpGlobalConfig()`'s device-detection and enable/disable
/// logic exactly (device probe empty → disable; local size mismatch →
/// disable; debug mode → re-enable last).
pub fn build_rank_ctx(reg: &EnvRegistry) -> RankCtx {
    let rank = reg.get_int("RANK").max(0) as u32;
    let world_size = reg.get_int("WORLD_SIZE").max(1) as u32;
    let local_rank = reg.get_int("LOCAL_RANK").max(0) as u32;
    let local_world_size = reg.get_int("LOCAL_WORLD_SIZE").max(1) as u32;
    let job_name = reg.get_string("ENV_ARGO_WORKFLOW_NAME");
    let debug = reg.get_bool("SYSTRACE_DEBUG_MODE");
    let prefix = reg.get_string("SYSTRACE_DEVICE_PREFIX");

    let mut devices = probe_devices(&prefix);
    devices.sort_unstable();

    let mut enable = true;
    if devices.is_empty() {
        log::warn!("no /dev/{prefix}* devices found, disabling tracing");
        enable = false;
    }
    if local_world_size as usize != devices.len() {
        log::warn!(
            "local_world_size ({local_world_size}) != detected device count ({}), disabling tracing",
            devices.len()
        );
        enable = false;
    }
    if debug {
        log::info!("SYSTRACE_DEBUG_MODE set, overriding device-probe checks");
        enable = true;
    }

    RankCtx {
        rank,
        world_size,
        local_rank,
        local_world_size,
        job_name,
        enable,
        debug,
        devices,
    }
}

fn probe_devices(prefix: &str) -> Vec<u32> {
    (0..16u32)
        .filter(|i| Path::new(&format!("/dev/{prefix}{i}")).exists())
        .collect()
}
