use std::rc::Rc;

use super::core::Database;
use crate::engine::{SQLITE_OK, SQLITE_UTF8};
use crate::error::{FunctionError, SqlBridgeError};
use crate::function::{self, Arity, FunctionOutput};
use crate::types::Value;

impl Database {
    /// Register a scalar SQL function backed by `callable`.
    ///
    /// Registering a name again replaces the previous function and returns its table slot
    /// to the pool first. An `Err` returned by the callable, or a panic inside it, fails
    /// the calling statement with the error's message.
    ///
    /// ```rust,no_run
    /// # use sql_bridge::prelude::*;
    /// # fn demo(db: &Database) -> Result<(), SqlBridgeError> {
    /// db.create_function("double", Arity::Exact(1), |args: &[Value]| {
    ///     let x = args[0].as_float().ok_or("double expects a number")?;
    ///     Ok(x * 2.0)
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::DatabaseClosed`, `SqlBridgeError::TableExhausted`, or the
    /// engine's registration error (the new slot is released again).
    pub fn create_function<F, R>(
        &self,
        name: &str,
        arity: Arity,
        callable: F,
    ) -> Result<(), SqlBridgeError>
    where
        F: FnMut(&[Value]) -> Result<R, FunctionError> + 'static,
        R: FunctionOutput,
    {
        let handle = self.shared.handle()?;
        let module = &self.shared.module;
        // Stage the name before touching the table so a failed write leaves the current
        // registration in place.
        let mut scope = self.shared.bridge().scoped();
        let (name_ptr, _) = scope.write_utf8(name)?;

        let previous = self.shared.functions.borrow_mut().remove(name);
        if let Some(slot) = previous {
            module.remove_function(slot);
        }

        let host = function::trampoline(
            Rc::downgrade(module.engine()),
            name.to_string(),
            function::boxed(callable),
        );
        let slot = module.add_function(host)?;

        let rc = self.shared.engine().create_function_v2(
            handle,
            name_ptr,
            arity.as_raw(),
            SQLITE_UTF8,
            0,
            slot,
            0,
            0,
            0,
        );
        drop(scope);
        if rc != SQLITE_OK {
            module.remove_function(slot);
            return Err(self.shared.engine_error(rc));
        }
        self.shared
            .functions
            .borrow_mut()
            .insert(name.to_string(), slot);
        tracing::debug!(%name, slot, arity = arity.as_raw(), "function registered");
        Ok(())
    }
}
