use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::bridge::MemoryBridge;
use crate::database::DatabaseShared;
use crate::engine::{
    Engine, Handle, Ptr, SQLITE_BLOB, SQLITE_DONE, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_OK,
    SQLITE_ROW, SQLITE_STATIC, SQLITE_TEXT,
};
use crate::error::SqlBridgeError;
use crate::results::Row;
use crate::types::{Params, Value};

/// State shared between a [`Statement`] and the registry of its database, which
/// finalizes every open statement on `close` and `export`.
pub(crate) struct StatementCore {
    handle: Cell<Handle>,
    /// Text and blob buffers backing the current bindings.
    temporaries: RefCell<Vec<Ptr>>,
}

impl StatementCore {
    pub(crate) fn new(handle: Handle) -> Rc<Self> {
        Rc::new(Self {
            handle: Cell::new(handle),
            temporaries: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn release_temporaries(&self, engine: &dyn Engine) {
        let bridge = MemoryBridge::new(engine);
        for ptr in self.temporaries.borrow_mut().drain(..) {
            bridge.free(ptr);
        }
    }

    /// Release the temporaries and finalize. Returns whether the engine reported OK.
    pub(crate) fn finalize(&self, engine: &dyn Engine) -> bool {
        self.release_temporaries(engine);
        let handle = self.handle.replace(0);
        engine.finalize(handle) == SQLITE_OK
    }
}

/// A prepared statement.
///
/// Statements are owned by the database that prepared them: dropping a `Statement` keeps
/// the prepared statement alive until [`Statement::free`], [`crate::Database::export`] or
/// [`crate::Database::close`]. Once finalized every method except `free` fails with
/// [`SqlBridgeError::StatementClosed`].
pub struct Statement {
    core: Rc<StatementCore>,
    db: Rc<DatabaseShared>,
    /// Next index for `bind_value` without an explicit index.
    param_cursor: i32,
    /// Next column for the typed getters without an explicit index.
    column_cursor: i32,
}

impl Statement {
    pub(crate) fn new(core: Rc<StatementCore>, db: Rc<DatabaseShared>) -> Self {
        Self {
            core,
            db,
            param_cursor: 1,
            column_cursor: 0,
        }
    }

    pub(crate) fn core(&self) -> Rc<StatementCore> {
        Rc::clone(&self.core)
    }

    fn engine(&self) -> &dyn Engine {
        self.db.engine()
    }

    fn handle(&self) -> Result<Handle, SqlBridgeError> {
        match self.core.handle.get() {
            0 => Err(SqlBridgeError::StatementClosed),
            handle => Ok(handle),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core.handle.get() != 0
    }

    /// Reset the statement and bind `params`, positionally from index 1 or by name.
    ///
    /// Names the statement does not declare are skipped. If any value fails to bind the
    /// statement is reset again, so no binding or temporary buffer survives the error.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::StatementClosed`, `SqlBridgeError::OutOfMemory`, or the
    /// engine's error for a rejected binding.
    pub fn bind(&mut self, params: &Params) -> Result<(), SqlBridgeError> {
        let handle = self.handle()?;
        self.reset()?;
        let outcome = match params {
            Params::Positional(values) => values.iter().enumerate().try_for_each(|(i, value)| {
                let index = i32::try_from(i + 1).map_err(|_| {
                    SqlBridgeError::EngineError(format!("too many parameters: {}", values.len()))
                })?;
                self.bind_at(handle, index, value)
            }),
            Params::Named(map) => map.iter().try_for_each(|(name, value)| {
                match self.parameter_index(handle, name)? {
                    0 => Ok(()),
                    index => self.bind_at(handle, index, value),
                }
            }),
        };
        if outcome.is_err() {
            self.reset()?;
        }
        outcome
    }

    /// Bind one value at `index`, or at the implicit cursor (which then advances).
    ///
    /// # Errors
    ///
    /// See [`Statement::bind`].
    pub fn bind_value(&mut self, value: &Value, index: Option<i32>) -> Result<(), SqlBridgeError> {
        let handle = self.handle()?;
        let index = index.unwrap_or_else(|| {
            let index = self.param_cursor;
            self.param_cursor += 1;
            index
        });
        self.bind_at(handle, index, value)
    }

    fn parameter_index(&self, handle: Handle, name: &str) -> Result<i32, SqlBridgeError> {
        let mut scope = MemoryBridge::new(self.engine()).scoped();
        let (ptr, _) = scope.write_utf8(name)?;
        Ok(self.engine().bind_parameter_index(handle, ptr))
    }

    fn bind_at(&self, handle: Handle, index: i32, value: &Value) -> Result<(), SqlBridgeError> {
        let engine = self.engine();
        let rc = match value {
            Value::Null => engine.bind_null(handle, index),
            Value::Bool(b) => engine.bind_int(handle, index, i32::from(*b)),
            Value::Integer(n) => engine.bind_int64(handle, index, *n),
            Value::Float(f) => match exact_i32(*f) {
                Some(n) => engine.bind_int(handle, index, n),
                None => engine.bind_double(handle, index, *f),
            },
            Value::Text(text) => {
                let mut scope = MemoryBridge::new(engine).scoped();
                let (ptr, len) = scope.write_utf8(text)?;
                let rc = engine.bind_text(handle, index, ptr, byte_len(len - 1), SQLITE_STATIC);
                self.core.temporaries.borrow_mut().extend(scope.into_ptrs());
                rc
            }
            Value::Blob(bytes) => {
                let mut scope = MemoryBridge::new(engine).scoped();
                let ptr = scope.write_blob(bytes)?;
                let rc = engine.bind_blob(handle, index, ptr, byte_len(bytes.len()), SQLITE_STATIC);
                self.core.temporaries.borrow_mut().extend(scope.into_ptrs());
                rc
            }
        };
        self.db.check(rc)
    }

    /// Advance to the next row. Returns `false` once the statement has completed.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::StatementClosed`, or `SqlBridgeError::EngineError` with the
    /// database's message for any status other than row/done.
    pub fn step(&mut self) -> Result<bool, SqlBridgeError> {
        let handle = self.handle()?;
        self.column_cursor = 0;
        match self.engine().step(handle) {
            SQLITE_ROW => Ok(true),
            SQLITE_DONE => Ok(false),
            rc => Err(self.db.engine_error(rc)),
        }
    }

    /// Values of the current row. With `params`, binds and steps first.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::StatementClosed`, a binding or stepping error, or
    /// `SqlBridgeError::MemoryAccess` if a column copy is out of bounds.
    pub fn get(&mut self, params: Option<&Params>) -> Result<Vec<Value>, SqlBridgeError> {
        if let Some(params) = params {
            self.bind(params)?;
            self.step()?;
        }
        let handle = self.handle()?;
        let count = self.engine().data_count(handle);
        (0..count).map(|i| self.column_value(handle, i)).collect()
    }

    fn column_value(&self, handle: Handle, column: i32) -> Result<Value, SqlBridgeError> {
        let engine = self.engine();
        Ok(match engine.column_type(handle, column) {
            SQLITE_INTEGER => Value::Integer(engine.column_int64(handle, column)),
            SQLITE_FLOAT => Value::Float(engine.column_double(handle, column)),
            SQLITE_TEXT => Value::Text(self.column_text(handle, column)?),
            SQLITE_BLOB => Value::Blob(self.column_blob(handle, column)?),
            _ => Value::Null,
        })
    }

    fn column_text(&self, handle: Handle, column: i32) -> Result<String, SqlBridgeError> {
        let engine = self.engine();
        let ptr = engine.column_text(handle, column);
        if ptr == 0 {
            return Ok(String::new());
        }
        let len = usize::try_from(engine.column_bytes(handle, column)).unwrap_or(0);
        let bytes = MemoryBridge::new(engine).read_blob(ptr, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn column_blob(&self, handle: Handle, column: i32) -> Result<Vec<u8>, SqlBridgeError> {
        let engine = self.engine();
        let len = usize::try_from(engine.column_bytes(handle, column)).unwrap_or(0);
        let ptr = engine.column_blob(handle, column);
        if ptr == 0 || len == 0 {
            return Ok(Vec::new());
        }
        MemoryBridge::new(engine).read_blob(ptr, len)
    }

    /// Result column names, available before the first step.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::StatementClosed`.
    pub fn get_column_names(&self) -> Result<Vec<String>, SqlBridgeError> {
        let handle = self.handle()?;
        let engine = self.engine();
        let bridge = MemoryBridge::new(engine);
        (0..engine.column_count(handle))
            .map(|i| bridge.read_utf8(engine.column_name(handle, i)))
            .collect()
    }

    /// The current row keyed by column name. With `params`, binds and steps first.
    ///
    /// # Errors
    ///
    /// See [`Statement::get`].
    pub fn get_as_object(&mut self, params: Option<&Params>) -> Result<Row, SqlBridgeError> {
        let values = self.get(params)?;
        let mut names = self.get_column_names()?;
        names.truncate(values.len());
        Ok(Row::new(Arc::new(names), values))
    }

    /// Bind (if given), step once discarding any row, then reset.
    ///
    /// # Errors
    ///
    /// See [`Statement::bind`] and [`Statement::step`].
    pub fn run(&mut self, params: Option<&Params>) -> Result<bool, SqlBridgeError> {
        if let Some(params) = params {
            self.bind(params)?;
        }
        self.step()?;
        self.reset()
    }

    /// Clear the bindings and rewind. Returns whether both engine calls succeeded; a
    /// statement whose last step failed reports `false`.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::StatementClosed`.
    pub fn reset(&mut self) -> Result<bool, SqlBridgeError> {
        let handle = self.handle()?;
        let engine = self.engine();
        let cleared = engine.clear_bindings(handle) == SQLITE_OK;
        let rewound = engine.reset(handle) == SQLITE_OK;
        self.core.release_temporaries(engine);
        self.param_cursor = 1;
        self.column_cursor = 0;
        Ok(cleared && rewound)
    }

    /// Release the buffers of the current text/blob bindings without finalizing.
    pub fn free_temporaries(&mut self) {
        self.core.release_temporaries(self.engine());
    }

    /// Finalize the statement and remove it from its database.
    ///
    /// Returns whether the engine reported success; freeing an already finalized
    /// statement is a no-op that returns `true`.
    pub fn free(self) -> bool {
        let handle = self.core.handle.get();
        if handle == 0 {
            self.core.release_temporaries(self.engine());
            return true;
        }
        self.db.statements.borrow_mut().remove(&handle);
        self.core.finalize(self.engine())
    }

    /// Number of columns in the current row (0 before a step or after completion).
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::StatementClosed`.
    pub fn column_count(&self) -> Result<i32, SqlBridgeError> {
        let handle = self.handle()?;
        Ok(self.engine().data_count(handle))
    }

    fn next_column(&mut self, index: Option<i32>) -> i32 {
        index.unwrap_or_else(|| {
            let column = self.column_cursor;
            self.column_cursor += 1;
            column
        })
    }

    /// Column `index` (or the next column) of the current row as a number.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::StatementClosed`.
    pub fn get_number(&mut self, index: Option<i32>) -> Result<f64, SqlBridgeError> {
        let handle = self.handle()?;
        let column = self.next_column(index);
        Ok(self.engine().column_double(handle, column))
    }

    /// # Errors
    ///
    /// Returns `SqlBridgeError::StatementClosed`.
    pub fn get_string(&mut self, index: Option<i32>) -> Result<String, SqlBridgeError> {
        let handle = self.handle()?;
        let column = self.next_column(index);
        self.column_text(handle, column)
    }

    /// # Errors
    ///
    /// Returns `SqlBridgeError::StatementClosed`.
    pub fn get_blob(&mut self, index: Option<i32>) -> Result<Vec<u8>, SqlBridgeError> {
        let handle = self.handle()?;
        let column = self.next_column(index);
        self.column_blob(handle, column)
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("handle", &self.core.handle.get())
            .field("temporaries", &self.core.temporaries.borrow().len())
            .finish_non_exhaustive()
    }
}

/// `Some` when `value` is integral and fits the 32-bit binder.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn exact_i32(value: f64) -> Option<i32> {
    (value.fract() == 0.0 && value >= f64::from(i32::MIN) && value <= f64::from(i32::MAX))
        .then_some(value as i32)
}

fn byte_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}
