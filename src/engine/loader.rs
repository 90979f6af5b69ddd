use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::{AbortHook, EngineOptions};
use crate::engine::Engine;
use crate::error::SqlBridgeError;
use crate::module::Module;

/// Instantiates an engine from finished options. The options passed in already carry
/// the composed abort hook.
pub type EngineFactory =
    Arc<dyn Fn(&EngineOptions) -> Result<Rc<dyn Engine>, SqlBridgeError> + Send + Sync>;

/// Instantiates the engine module once per execution context.
///
/// Concurrent and repeated calls to [`Loader::module`] share one instance. A failed
/// instantiation is reported to every waiter of that attempt and the next call retries.
pub struct Loader {
    options: EngineOptions,
    factory: EngineFactory,
    module: OnceCell<Rc<Module>>,
}

impl Loader {
    #[must_use]
    pub fn new(options: EngineOptions) -> Self {
        Self::with_factory(options, default_factory())
    }

    #[must_use]
    pub fn with_factory(options: EngineOptions, factory: EngineFactory) -> Self {
        Self {
            options,
            factory,
            module: OnceCell::new(),
        }
    }

    /// The loaded module, instantiating it on first use.
    ///
    /// # Errors
    ///
    /// Returns the configuration or instantiation error; the abort hook has been called
    /// with its message.
    pub async fn module(&self) -> Result<Rc<Module>, SqlBridgeError> {
        self.module
            .get_or_try_init(|| self.instantiate())
            .await
            .map(Rc::clone)
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.module.initialized()
    }

    async fn instantiate(&self) -> Result<Rc<Module>, SqlBridgeError> {
        let hook = compose_abort_hook(self.options.on_abort.clone());
        let mut options = self.options.clone();
        options.on_abort = Some(Arc::clone(&hook));
        match options.validate().and_then(|()| (self.factory)(&options)) {
            Ok(engine) => {
                tracing::debug!(
                    storage_dir = %options.storage_dir.display(),
                    max_memory = options.max_memory,
                    "engine module loaded"
                );
                Ok(Module::new(engine))
            }
            Err(err) => {
                hook(&err.to_string());
                Err(err)
            }
        }
    }
}

/// The loader's own abort handling, followed by the caller's hook if one was given.
pub(crate) fn compose_abort_hook(user: Option<AbortHook>) -> AbortHook {
    Arc::new(move |message: &str| {
        tracing::error!(%message, "engine module aborted");
        if let Some(user) = &user {
            user(message);
        }
    })
}

#[cfg(feature = "native")]
fn default_factory() -> EngineFactory {
    Arc::new(|options| {
        let engine: Rc<dyn Engine> = crate::engine::native::NativeEngine::new(options)?;
        Ok(engine)
    })
}

#[cfg(not(feature = "native"))]
fn default_factory() -> EngineFactory {
    Arc::new(|_| {
        Err(SqlBridgeError::ConfigError(
            "no engine module compiled in; enable the `native` feature".to_string(),
        ))
    })
}
