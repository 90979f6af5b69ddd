use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use crate::engine::loader::Loader;
use crate::error::SqlBridgeError;
use crate::module::Module;

/// Smallest linear memory the engine can run in (one 64 KiB page).
pub const MIN_MEMORY: usize = 64 * 1024;

const DEFAULT_MAX_MEMORY: usize = 256 * 1024 * 1024;

/// Callback invoked with a message when the engine module aborts.
pub type AbortHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Options for instantiating an engine module.
#[derive(Clone)]
pub struct EngineOptions {
    /// Directory backing the virtual filesystem that holds database files.
    pub storage_dir: PathBuf,
    /// Ceiling for linear memory in bytes; allocations beyond it fail.
    pub max_memory: usize,
    pub on_abort: Option<AbortHook>,
}

impl EngineOptions {
    #[must_use]
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn builder() -> EngineOptionsBuilder {
        EngineOptionsBuilder::new()
    }

    /// # Errors
    ///
    /// Returns `SqlBridgeError::ConfigError` when `max_memory` is below one page.
    pub fn validate(&self) -> Result<(), SqlBridgeError> {
        if self.max_memory < MIN_MEMORY {
            return Err(SqlBridgeError::ConfigError(format!(
                "max_memory must be at least {MIN_MEMORY} bytes, got {}",
                self.max_memory
            )));
        }
        Ok(())
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            storage_dir: std::env::temp_dir().join("sql-bridge"),
            max_memory: DEFAULT_MAX_MEMORY,
            on_abort: None,
        }
    }
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("storage_dir", &self.storage_dir)
            .field("max_memory", &self.max_memory)
            .field("on_abort", &self.on_abort.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

/// Fluent builder for engine options.
#[derive(Debug, Clone, Default)]
pub struct EngineOptionsBuilder {
    opts: EngineOptions,
}

impl EngineOptionsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn storage_dir(mut self, storage_dir: impl Into<PathBuf>) -> Self {
        self.opts.storage_dir = storage_dir.into();
        self
    }

    #[must_use]
    pub fn max_memory(mut self, max_memory: usize) -> Self {
        self.opts.max_memory = max_memory;
        self
    }

    #[must_use]
    pub fn on_abort(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.opts.on_abort = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn finish(self) -> EngineOptions {
        self.opts
    }

    /// Instantiate an engine module with these options.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError` if the options are invalid or instantiation fails.
    pub async fn build(self) -> Result<Rc<Module>, SqlBridgeError> {
        Loader::new(self.finish()).module().await
    }
}

/// Options for spawning a worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub engine: EngineOptions,
    /// Prefix for the worker and router thread names.
    pub thread_name: String,
}

impl WorkerOptions {
    #[must_use]
    pub fn new(engine: EngineOptions) -> Self {
        Self {
            engine,
            thread_name: "sql-bridge".to_string(),
        }
    }

    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let opts = EngineOptions::builder()
            .storage_dir("/tmp/x")
            .max_memory(MIN_MEMORY * 2)
            .on_abort(|_| {})
            .finish();
        assert_eq!(opts.storage_dir, PathBuf::from("/tmp/x"));
        assert_eq!(opts.max_memory, MIN_MEMORY * 2);
        assert!(opts.on_abort.is_some());
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn tiny_memory_is_rejected() {
        let opts = EngineOptions::builder().max_memory(1024).finish();
        assert!(matches!(
            opts.validate(),
            Err(SqlBridgeError::ConfigError(_))
        ));
    }
}
