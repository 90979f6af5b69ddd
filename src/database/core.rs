use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::rc::Rc;

use crate::bridge::MemoryBridge;
use crate::engine::{Engine, Handle, SQLITE_OK};
use crate::error::SqlBridgeError;
use crate::module::Module;
use crate::statement::StatementCore;

/// State shared by a [`Database`] and the statements it prepared.
pub(crate) struct DatabaseShared {
    pub(crate) module: Rc<Module>,
    pub(crate) filename: String,
    /// 0 once closed.
    pub(crate) handle: Cell<Handle>,
    pub(crate) statements: RefCell<HashMap<Handle, Rc<StatementCore>>>,
    pub(crate) functions: RefCell<HashMap<String, u32>>,
}

impl DatabaseShared {
    pub(crate) fn engine(&self) -> &dyn Engine {
        &**self.module.engine()
    }

    pub(crate) fn bridge(&self) -> MemoryBridge<'_> {
        MemoryBridge::new(self.engine())
    }

    pub(crate) fn handle(&self) -> Result<Handle, SqlBridgeError> {
        match self.handle.get() {
            0 => Err(SqlBridgeError::DatabaseClosed),
            handle => Ok(handle),
        }
    }

    /// The engine's current error message for this connection.
    pub(crate) fn errmsg(&self) -> String {
        let ptr = self.engine().errmsg(self.handle.get());
        self.bridge()
            .read_utf8(ptr)
            .unwrap_or_else(|err| format!("unreadable engine error message: {err}"))
    }

    pub(crate) fn engine_error(&self, rc: i32) -> SqlBridgeError {
        let message = self.errmsg();
        tracing::debug!(rc, %message, filename = %self.filename, "engine call failed");
        SqlBridgeError::EngineError(message)
    }

    pub(crate) fn check(&self, rc: i32) -> Result<(), SqlBridgeError> {
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(self.engine_error(rc))
        }
    }

    /// Finalize every registered statement and release every function slot.
    pub(crate) fn release_all(&self) {
        let statements: Vec<_> = self.statements.borrow_mut().drain().collect();
        for (handle, core) in statements {
            if !core.finalize(self.engine()) {
                tracing::debug!(handle, "finalize reported an earlier step failure");
            }
        }
        let functions: Vec<_> = self.functions.borrow_mut().drain().collect();
        for (name, slot) in functions {
            tracing::trace!(%name, slot, "releasing function");
            self.module.remove_function(slot);
        }
    }

    /// Open the backing file and register the bundled extension functions.
    pub(crate) fn open_handle(&self) -> Result<Handle, SqlBridgeError> {
        let engine = self.engine();
        let mut scope = self.bridge().scoped();
        let (name, _) = scope.write_utf8(&self.filename)?;
        let out = scope.allocate(4)?;
        scope.bridge().write_u32(out, 0)?;
        let rc = engine.open(name, out);
        let handle = scope.bridge().read_u32(out)?;
        if rc != SQLITE_OK {
            let message = if handle == 0 {
                format!("unable to open database file {}", self.filename)
            } else {
                let message = scope.bridge().read_utf8(engine.errmsg(handle))?;
                engine.close_v2(handle);
                message
            };
            return Err(SqlBridgeError::EngineError(message));
        }
        let rc = engine.register_extension_functions(handle);
        if rc != SQLITE_OK {
            let message = scope.bridge().read_utf8(engine.errmsg(handle))?;
            engine.close_v2(handle);
            return Err(SqlBridgeError::EngineError(message));
        }
        Ok(handle)
    }
}

/// A database living in the engine, backed by a uniquely named file in the engine's
/// virtual filesystem.
///
/// Closing (explicitly or by dropping) finalizes every statement, releases every user
/// function and deletes the backing file.
pub struct Database {
    pub(crate) shared: Rc<DatabaseShared>,
}

impl Database {
    /// Create a fresh backing file (seeded with `data` if given) and open it.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::Io` if the file cannot be written, or
    /// `SqlBridgeError::EngineError` if the engine rejects it (e.g. `data` is not a
    /// database image). A file created for a failed open is removed.
    pub fn open(module: &Rc<Module>, data: Option<&[u8]>) -> Result<Self, SqlBridgeError> {
        let fs = module.engine().fs();
        let filename = loop {
            let candidate = format!("dbfile_{}", rand::random::<u32>());
            if !fs.exists(&candidate) {
                break candidate;
            }
        };
        if let Some(bytes) = data {
            fs.write_file(&filename, bytes)?;
        }
        let shared = Rc::new(DatabaseShared {
            module: Rc::clone(module),
            filename,
            handle: Cell::new(0),
            statements: RefCell::new(HashMap::new()),
            functions: RefCell::new(HashMap::new()),
        });
        match shared.open_handle() {
            Ok(handle) => {
                shared.handle.set(handle);
                tracing::debug!(filename = %shared.filename, handle, seeded = data.is_some(), "database opened");
                Ok(Self { shared })
            }
            Err(err) => {
                remove_backing_file(fs, &shared.filename);
                Err(err)
            }
        }
    }

    /// Name of the backing file in the virtual filesystem.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.shared.filename
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.handle.get() != 0
    }

    #[must_use]
    pub fn open_statement_count(&self) -> usize {
        self.shared.statements.borrow().len()
    }

    #[must_use]
    pub fn module(&self) -> &Rc<Module> {
        &self.shared.module
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::DatabaseClosed`.
    pub fn get_rows_modified(&self) -> Result<i32, SqlBridgeError> {
        let handle = self.shared.handle()?;
        Ok(self.shared.engine().changes(handle))
    }

    /// Snapshot the database file.
    ///
    /// Every open statement is finalized and every user function released first, the
    /// connection is closed so the file is complete, and a fresh connection is opened on
    /// the same file. The database stays usable; user functions must be created again.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::DatabaseClosed`, the engine's close/open error, or
    /// `SqlBridgeError::Io` if the file cannot be read. If the reopen fails the database
    /// stays closed and its backing file is removed.
    pub fn export(&self) -> Result<Vec<u8>, SqlBridgeError> {
        let handle = self.shared.handle()?;
        self.shared.release_all();
        self.shared.check(self.shared.engine().close_v2(handle))?;
        self.shared.handle.set(0);
        let fs = self.shared.engine().fs();
        let bytes = match fs.read_file(&self.shared.filename) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            other => other,
        };
        let reopened = match self.shared.open_handle() {
            Ok(handle) => handle,
            Err(err) => {
                // Nothing owns the file any more; drop skips closed databases.
                remove_backing_file(fs, &self.shared.filename);
                return Err(err);
            }
        };
        self.shared.handle.set(reopened);
        let bytes = bytes?;
        tracing::debug!(filename = %self.shared.filename, bytes = bytes.len(), handle = reopened, "database exported");
        Ok(bytes)
    }

    /// Close the connection and delete the backing file.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::DatabaseClosed` if already closed, or the engine's close
    /// error (the database then stays open).
    pub fn close(&self) -> Result<(), SqlBridgeError> {
        let handle = self.shared.handle()?;
        self.shared.release_all();
        self.shared.check(self.shared.engine().close_v2(handle))?;
        self.shared.handle.set(0);
        remove_backing_file(self.shared.engine().fs(), &self.shared.filename);
        tracing::debug!(filename = %self.shared.filename, handle, "database closed");
        Ok(())
    }
}

fn remove_backing_file(fs: &dyn crate::engine::VirtualFs, filename: &str) {
    match fs.unlink(filename) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(%filename, error = %err, "failed to remove backing file"),
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                tracing::warn!(filename = %self.shared.filename, error = %err, "closing database on drop failed");
            }
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("filename", &self.shared.filename)
            .field("handle", &self.shared.handle.get())
            .field("statements", &self.shared.statements.borrow().len())
            .field("functions", &self.shared.functions.borrow().len())
            .finish()
    }
}
