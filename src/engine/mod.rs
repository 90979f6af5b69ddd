//! The foreign function table.
//!
//! Everything above this module talks to the SQL engine only through [`Engine`]: integer
//! handles, 32-bit addresses into the engine's linear memory, and status codes. The
//! table mirrors the SQLite C API closely enough that any module exporting it can be
//! plugged in; [`native`] is the implementation shipped with the crate.

use std::io;
use std::rc::Rc;

pub mod loader;
#[cfg(feature = "native")]
pub mod native;

/// Address in linear memory. `0` is null.
pub type Ptr = u32;

/// Opaque engine handle (database, statement, argument value or result context).
pub type Handle = u32;

/// Entry of the indirect function table: `(result context, argc, argv)` where `argv`
/// points at `argc` little-endian `u32` argument-value handles.
pub type HostFunction = Rc<dyn Fn(Handle, i32, Ptr)>;

pub const SQLITE_OK: i32 = 0;
pub const SQLITE_ERROR: i32 = 1;
pub const SQLITE_NOMEM: i32 = 7;
pub const SQLITE_MISUSE: i32 = 21;
pub const SQLITE_ROW: i32 = 100;
pub const SQLITE_DONE: i32 = 101;

pub const SQLITE_INTEGER: i32 = 1;
pub const SQLITE_FLOAT: i32 = 2;
pub const SQLITE_TEXT: i32 = 3;
pub const SQLITE_BLOB: i32 = 4;
pub const SQLITE_NULL: i32 = 5;

pub const SQLITE_UTF8: i32 = 1;

/// Destructor argument: the engine may keep the pointer as is.
pub const SQLITE_STATIC: i32 = 0;
/// Destructor argument: the engine copies the buffer before returning.
pub const SQLITE_TRANSIENT: i32 = -1;

/// Named backing store for database files.
pub trait VirtualFs {
    /// Create or replace `name` with `contents`.
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    fn write_file(&self, name: &str, contents: &[u8]) -> io::Result<()>;

    /// # Errors
    /// Returns the underlying I/O error, `NotFound` if `name` does not exist.
    fn read_file(&self, name: &str) -> io::Result<Vec<u8>>;

    /// # Errors
    /// Returns the underlying I/O error, `NotFound` if `name` does not exist.
    fn unlink(&self, name: &str) -> io::Result<()>;

    fn exists(&self, name: &str) -> bool;
}

/// The function table of an instantiated engine module.
///
/// Methods take `&self` and must tolerate re-entry: `step` and `exec` call back into the
/// indirect function table, whose entries in turn call the `value_*`, `result_*` and
/// memory functions of the same engine.
pub trait Engine {
    // Linear memory.
    fn malloc(&self, size: u32) -> Ptr;
    fn free(&self, ptr: Ptr);
    /// Copy `buf.len()` bytes starting at `ptr` into `buf`. Returns false when out of bounds.
    fn read_memory(&self, ptr: Ptr, buf: &mut [u8]) -> bool;
    /// Store `bytes` at `ptr`. Returns false when out of bounds.
    fn write_memory(&self, ptr: Ptr, bytes: &[u8]) -> bool;
    /// Current size of linear memory in bytes.
    fn memory_size(&self) -> usize;

    // Indirect function table.
    fn table_len(&self) -> u32;
    /// Grow the table by `delta` empty entries and return the previous length, or `None`
    /// when the table cannot grow.
    fn table_grow(&self, delta: u32) -> Option<u32>;
    fn table_set(&self, slot: u32, function: Option<HostFunction>);

    // Connections.
    fn open(&self, filename: Ptr, db_out: Ptr) -> i32;
    fn close_v2(&self, db: Handle) -> i32;
    fn exec(&self, db: Handle, sql: Ptr, callback: u32, arg: Ptr, errmsg_out: Ptr) -> i32;
    fn changes(&self, db: Handle) -> i32;
    fn errmsg(&self, db: Handle) -> Ptr;
    fn register_extension_functions(&self, db: Handle) -> i32;

    // Statements.
    fn prepare_v2(&self, db: Handle, sql: Ptr, nbyte: i32, stmt_out: Ptr, tail_out: Ptr)
    -> i32;
    fn bind_text(&self, stmt: Handle, index: i32, text: Ptr, nbyte: i32, destructor: i32) -> i32;
    fn bind_blob(&self, stmt: Handle, index: i32, blob: Ptr, nbyte: i32, destructor: i32) -> i32;
    fn bind_double(&self, stmt: Handle, index: i32, value: f64) -> i32;
    fn bind_int(&self, stmt: Handle, index: i32, value: i32) -> i32;
    fn bind_int64(&self, stmt: Handle, index: i32, value: i64) -> i32;
    fn bind_null(&self, stmt: Handle, index: i32) -> i32;
    fn bind_parameter_index(&self, stmt: Handle, name: Ptr) -> i32;
    fn step(&self, stmt: Handle) -> i32;
    fn data_count(&self, stmt: Handle) -> i32;
    fn column_count(&self, stmt: Handle) -> i32;
    fn column_type(&self, stmt: Handle, column: i32) -> i32;
    fn column_text(&self, stmt: Handle, column: i32) -> Ptr;
    fn column_blob(&self, stmt: Handle, column: i32) -> Ptr;
    fn column_bytes(&self, stmt: Handle, column: i32) -> i32;
    fn column_double(&self, stmt: Handle, column: i32) -> f64;
    fn column_int64(&self, stmt: Handle, column: i32) -> i64;
    fn column_name(&self, stmt: Handle, column: i32) -> Ptr;
    fn reset(&self, stmt: Handle) -> i32;
    fn clear_bindings(&self, stmt: Handle) -> i32;
    fn finalize(&self, stmt: Handle) -> i32;

    // User-defined functions. `x_func` is a slot of the indirect function table.
    #[allow(clippy::too_many_arguments)]
    fn create_function_v2(
        &self,
        db: Handle,
        name: Ptr,
        n_arg: i32,
        text_rep: i32,
        app: Ptr,
        x_func: u32,
        x_step: u32,
        x_final: u32,
        x_destroy: u32,
    ) -> i32;
    fn value_type(&self, value: Handle) -> i32;
    fn value_text(&self, value: Handle) -> Ptr;
    fn value_blob(&self, value: Handle) -> Ptr;
    fn value_bytes(&self, value: Handle) -> i32;
    fn value_double(&self, value: Handle) -> f64;
    fn value_int64(&self, value: Handle) -> i64;
    fn result_null(&self, ctx: Handle);
    fn result_int(&self, ctx: Handle, value: i32);
    fn result_int64(&self, ctx: Handle, value: i64);
    fn result_double(&self, ctx: Handle, value: f64);
    fn result_text(&self, ctx: Handle, text: Ptr, nbyte: i32, destructor: i32);
    fn result_blob(&self, ctx: Handle, blob: Ptr, nbyte: i32, destructor: i32);
    /// A null `message` reports out-of-memory.
    fn result_error(&self, ctx: Handle, message: Ptr, nbyte: i32);

    fn fs(&self) -> &dyn VirtualFs;
}
