//! Bridge configuration, read from TOML.
//!
//! Every field has a default, so an empty document is a valid config.
//! The number of trampolines is not configured here: it is fixed when the
//! crate is built (`HOSTCALL_TRAMPOLINE_SLOTS`).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::diagnostics::SinkKind;
use crate::error::BridgeError;

const MAX_WORKERS: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
}

/// Heap settings the embedder passes on when creating the VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Bytes allocated before the first collection.
    pub initial_heap_size: u64,
    /// Lower bound for the heap size after a collection.
    pub min_heap_size: u64,
    /// Growth after each collection, as a percentage of live bytes.
    pub heap_growth_percent: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            initial_heap_size: 10 * 1024 * 1024,
            min_heap_size: 1024 * 1024,
            heap_growth_percent: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub sink: SinkKind,
}

/// Worker pool behind the script-visible futures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Worker threads; 0 uses one per available CPU.
    pub workers: usize,
    /// Jobs queued before `submit` blocks; 0 uses ten per worker.
    pub queue_depth: usize,
}

impl TaskConfig {
    pub fn resolved_workers(&self) -> usize {
        match self.workers {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }

    pub fn resolved_queue_depth(&self) -> usize {
        match self.queue_depth {
            0 => self.resolved_workers() * 10,
            n => n,
        }
    }
}

impl BridgeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, BridgeError> {
        let config: Self = toml::from_str(s).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a specific file path.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("cannot read '{}': {}", path.display(), e)))?;
        Self::from_toml_str(&content).map_err(|e| match e {
            BridgeError::Config(msg) => BridgeError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn to_toml_string(&self) -> Result<String, BridgeError> {
        toml::to_string(self).map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        let vm = &self.vm;
        if vm.heap_growth_percent == 0 {
            return Err(BridgeError::Config(
                "vm.heap_growth_percent must be positive".to_string(),
            ));
        }
        if vm.min_heap_size > vm.initial_heap_size {
            return Err(BridgeError::Config(format!(
                "vm.min_heap_size ({}) exceeds vm.initial_heap_size ({})",
                vm.min_heap_size, vm.initial_heap_size
            )));
        }
        if self.tasks.workers > MAX_WORKERS {
            return Err(BridgeError::Config(format!(
                "tasks.workers ({}) exceeds {MAX_WORKERS}",
                self.tasks.workers
            )));
        }
        Ok(())
    }

    /// Default `hostcall.toml` contents.
    pub fn default_template() -> &'static str {
        r#"[vm]
initial_heap_size = 10485760
min_heap_size = 1048576
heap_growth_percent = 50

[diagnostics]
# stdio | tracing | discard
sink = "stdio"

[tasks]
# 0 = one worker per CPU
workers = 0
# 0 = ten queued jobs per worker
queue_depth = 0
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_returns_default() {
        let cfg = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, BridgeConfig::default());
        assert_eq!(cfg.vm.initial_heap_size, 10 * 1024 * 1024);
        assert_eq!(cfg.diagnostics.sink, SinkKind::Stdio);
    }

    #[test]
    fn default_template_matches_defaults() {
        let cfg = BridgeConfig::from_toml_str(BridgeConfig::default_template()).unwrap();
        assert_eq!(cfg, BridgeConfig::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = BridgeConfig::from_toml_str(
            r#"
[vm]
heap_growth_percent = 25

[diagnostics]
sink = "discard"
"#,
        )
        .unwrap();
        assert_eq!(cfg.vm.heap_growth_percent, 25);
        assert_eq!(cfg.vm.min_heap_size, 1024 * 1024);
        assert_eq!(cfg.diagnostics.sink, SinkKind::Discard);
    }

    #[test]
    fn invalid_toml_returns_error() {
        let err = BridgeConfig::from_toml_str("[vm\nbroken").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn unknown_sink_is_rejected() {
        let err = BridgeConfig::from_toml_str("[diagnostics]\nsink = \"syslog\"").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn inconsistent_heap_sizes_rejected() {
        let err = BridgeConfig::from_toml_str(
            "[vm]\ninitial_heap_size = 1024\nmin_heap_size = 4096",
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn serialized_config_parses_back() {
        let mut cfg = BridgeConfig::default();
        cfg.diagnostics.sink = SinkKind::Tracing;
        let text = cfg.to_toml_string().unwrap();
        assert_eq!(BridgeConfig::from_toml_str(&text).unwrap(), cfg);
    }

    #[test]
    fn task_defaults_follow_worker_count() {
        let cfg = BridgeConfig::from_toml_str("[tasks]\nworkers = 3").unwrap();
        assert_eq!(cfg.tasks.resolved_workers(), 3);
        assert_eq!(cfg.tasks.resolved_queue_depth(), 30);
        assert!(BridgeConfig::default().tasks.resolved_workers() >= 1);
    }

    #[test]
    fn too_many_workers_rejected() {
        let err = BridgeConfig::from_toml_str("[tasks]\nworkers = 5000").unwrap_err();
        assert!(err.to_string().contains("tasks.workers"));
    }

    #[test]
    fn load_missing_file_mentions_path() {
        let err = BridgeConfig::load(Path::new("/nonexistent/hostcall.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/hostcall.toml"));
    }
}
