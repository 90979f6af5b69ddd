//! The bundled engine module: SQLite through `rusqlite::ffi`, with an emulated linear
//! memory and token handles in front of every raw pointer.
//!
//! Pointers handed out by the table point into linear memory and are owned by the
//! module: column text/blob/name copies live until the next step, reset or finalize of
//! their statement, argument copies until the current function call returns, and error
//! messages until the next `errmsg` for the same database.
#![allow(unsafe_code)]

mod extensions;
mod fs;
mod heap;
mod registry;

pub use fs::DirectoryFs;
pub use heap::PAGE_SIZE;

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::{Rc, Weak};

use rusqlite::ffi;

use crate::config::{AbortHook, EngineOptions};
use crate::engine::{
    Engine, Handle, HostFunction, Ptr, SQLITE_MISUSE, SQLITE_OK, VirtualFs,
};
use crate::error::SqlBridgeError;
use crate::function::panic_message;
use heap::LinearHeap;
use registry::HandleRegistry;

const SQLITE_CANTOPEN: c_int = 14;
const SQLITE_TOOBIG: c_int = 18;
const OPEN_READWRITE: c_int = 0x0000_0002;
const OPEN_CREATE: c_int = 0x0000_0004;

// libsqlite3-sys blocklists `sqlite3_close_v2` from its generated bindings; the bundled
// library still exports the symbol.
unsafe extern "C" {
    fn sqlite3_close_v2(db: *mut ffi::sqlite3) -> c_int;
}

struct NativeStatement {
    raw: *mut ffi::sqlite3_stmt,
    /// Column copies handed out since the last step/reset.
    scratch: Vec<Ptr>,
}

/// Function table entry data registered with SQLite for each user function.
struct FunctionBinding {
    engine: Weak<NativeEngine>,
    slot: u32,
}

pub struct NativeEngine {
    this: Weak<NativeEngine>,
    heap: RefCell<LinearHeap>,
    databases: RefCell<HandleRegistry<*mut ffi::sqlite3>>,
    statements: RefCell<HandleRegistry<NativeStatement>>,
    values: RefCell<HandleRegistry<*mut ffi::sqlite3_value>>,
    contexts: RefCell<HandleRegistry<*mut ffi::sqlite3_context>>,
    errmsgs: RefCell<HashMap<Handle, Ptr>>,
    /// Argument copies made during each active function call, innermost last.
    frames: RefCell<Vec<Vec<Ptr>>>,
    table: RefCell<Vec<Option<HostFunction>>>,
    fs: DirectoryFs,
    on_abort: Option<AbortHook>,
}

impl NativeEngine {
    /// Instantiate the module.
    ///
    /// # Errors
    ///
    /// Returns `SqlBridgeError::ConfigError` for invalid options and `SqlBridgeError::Io`
    /// if the storage directory cannot be created.
    pub fn new(options: &EngineOptions) -> Result<Rc<Self>, SqlBridgeError> {
        options.validate()?;
        let fs = DirectoryFs::new(&options.storage_dir)?;
        Ok(Rc::new_cyclic(|this| Self {
            this: this.clone(),
            heap: RefCell::new(LinearHeap::new(options.max_memory)),
            databases: RefCell::new(HandleRegistry::new()),
            statements: RefCell::new(HandleRegistry::new()),
            values: RefCell::new(HandleRegistry::new()),
            contexts: RefCell::new(HandleRegistry::new()),
            errmsgs: RefCell::new(HashMap::new()),
            frames: RefCell::new(Vec::new()),
            // slot 0 is the null function pointer
            table: RefCell::new(vec![None]),
            fs,
            on_abort: options.on_abort.clone(),
        }))
    }

    /// Bytes of linear memory currently allocated.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.heap.borrow().allocated()
    }

    #[must_use]
    pub fn live_statements(&self) -> usize {
        self.statements.borrow().len()
    }

    #[must_use]
    pub fn live_databases(&self) -> usize {
        self.databases.borrow().len()
    }

    #[must_use]
    pub fn directory(&self) -> &DirectoryFs {
        &self.fs
    }

    fn abort(&self, message: &str) {
        match &self.on_abort {
            Some(hook) => hook(message),
            None => tracing::error!(%message, "engine module aborted"),
        }
    }

    fn db_raw(&self, db: Handle) -> Option<*mut ffi::sqlite3> {
        self.databases.borrow().get(db).copied()
    }

    fn stmt_raw(&self, stmt: Handle) -> Option<*mut ffi::sqlite3_stmt> {
        self.statements.borrow().get(stmt).map(|s| s.raw)
    }

    fn value_raw(&self, value: Handle) -> Option<*mut ffi::sqlite3_value> {
        self.values.borrow().get(value).copied()
    }

    fn ctx_raw(&self, ctx: Handle) -> Option<*mut ffi::sqlite3_context> {
        let raw = self.contexts.borrow().get(ctx).copied();
        if raw.is_none() {
            tracing::warn!(ctx, "result for unknown function context ignored");
        }
        raw
    }

    /// Bytes of an input argument: NUL-terminated when `nbyte` is negative.
    fn read_input(&self, ptr: Ptr, nbyte: i32) -> Option<Vec<u8>> {
        let heap = self.heap.borrow();
        match usize::try_from(nbyte) {
            Ok(len) => heap.bytes(ptr, len),
            Err(_) => heap.c_bytes(ptr),
        }
    }

    fn read_c_string(&self, ptr: Ptr) -> Option<CString> {
        if ptr == 0 {
            return None;
        }
        let bytes = self.heap.borrow().c_bytes(ptr)?;
        CString::new(bytes).ok()
    }

    /// Copy `bytes` into a fresh allocation, NUL-terminated if asked. Returns 0 on OOM.
    fn copy_out(&self, bytes: &[u8], nul: bool) -> Ptr {
        let len = bytes.len() + usize::from(nul);
        let Ok(size) = u32::try_from(len) else {
            return 0;
        };
        let mut heap = self.heap.borrow_mut();
        let ptr = heap.malloc(size);
        if ptr != 0 {
            heap.write(ptr, bytes);
            if nul {
                #[allow(clippy::cast_possible_truncation)]
                heap.write(ptr + bytes.len() as u32, &[0]);
            }
        }
        ptr
    }

    fn write_handle(&self, out: Ptr, handle: Handle) {
        if out != 0 {
            self.heap.borrow_mut().write(out, &handle.to_le_bytes());
        }
    }

    fn clear_scratch(&self, stmt: Handle) {
        let scratch = self
            .statements
            .borrow_mut()
            .get_mut(stmt)
            .map(|s| std::mem::take(&mut s.scratch))
            .unwrap_or_default();
        let mut heap = self.heap.borrow_mut();
        for ptr in scratch {
            heap.free(ptr);
        }
    }

    fn column_copy(&self, stmt: Handle, bytes: &[u8], nul: bool) -> Ptr {
        let ptr = self.copy_out(bytes, nul);
        if ptr != 0 {
            if let Some(entry) = self.statements.borrow_mut().get_mut(stmt) {
                entry.scratch.push(ptr);
            }
        }
        ptr
    }

    fn frame_copy(&self, bytes: &[u8], nul: bool) -> Ptr {
        let ptr = self.copy_out(bytes, nul);
        if ptr != 0 {
            match self.frames.borrow_mut().last_mut() {
                Some(frame) => frame.push(ptr),
                None => tracing::warn!(ptr, "argument copied outside of a function call"),
            }
        }
        ptr
    }

    /// Run the host function in `slot` for one SQLite callback.
    fn invoke(
        &self,
        slot: u32,
        ctx: *mut ffi::sqlite3_context,
        args: &[*mut ffi::sqlite3_value],
    ) -> Result<(), String> {
        let function = self
            .table
            .borrow()
            .get(slot as usize)
            .cloned()
            .flatten()
            .ok_or_else(|| format!("no function in table slot {slot}"))?;
        let frame = CallFrame::enter(self, ctx, args)?;
        function(frame.ctx, frame.argc(), frame.argv);
        Ok(())
    }
}

/// Token registrations and argument memory for one host function call.
struct CallFrame<'a> {
    engine: &'a NativeEngine,
    ctx: Handle,
    values: Vec<Handle>,
    argv: Ptr,
}

impl<'a> CallFrame<'a> {
    fn enter(
        engine: &'a NativeEngine,
        ctx: *mut ffi::sqlite3_context,
        args: &[*mut ffi::sqlite3_value],
    ) -> Result<Self, String> {
        let ctx = engine.contexts.borrow_mut().insert(ctx);
        let values = {
            let mut registry = engine.values.borrow_mut();
            args.iter().map(|&raw| registry.insert(raw)).collect()
        };
        engine.frames.borrow_mut().push(Vec::new());
        let mut frame = CallFrame {
            engine,
            ctx,
            values,
            argv: 0,
        };
        let argv: Vec<u8> = frame.values.iter().flat_map(|v| v.to_le_bytes()).collect();
        frame.argv = engine.copy_out(&argv, false);
        if frame.argv == 0 {
            return Err("out of memory".to_string());
        }
        Ok(frame)
    }

    fn argc(&self) -> i32 {
        i32::try_from(self.values.len()).unwrap_or(i32::MAX)
    }
}

impl Drop for CallFrame<'_> {
    fn drop(&mut self) {
        let scratch = self.engine.frames.borrow_mut().pop().unwrap_or_default();
        {
            let mut heap = self.engine.heap.borrow_mut();
            heap.free(self.argv);
            for ptr in scratch {
                heap.free(ptr);
            }
        }
        let mut values = self.engine.values.borrow_mut();
        for value in &self.values {
            values.remove(*value);
        }
        self.engine.contexts.borrow_mut().remove(self.ctx);
    }
}

unsafe extern "C" fn call_host_function(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    // SAFETY: user data is the FunctionBinding boxed in create_function_v2; SQLite keeps
    // it alive until drop_binding runs.
    let binding = unsafe { &*ffi::sqlite3_user_data(ctx).cast::<FunctionBinding>() };
    let args = match usize::try_from(argc) {
        // SAFETY: SQLite passes `argc` valid value pointers in `argv`.
        Ok(n) if n > 0 && !argv.is_null() => unsafe { std::slice::from_raw_parts(argv, n) }.to_vec(),
        _ => Vec::new(),
    };
    let Some(engine) = binding.engine.upgrade() else {
        set_error(ctx, "engine module dropped");
        return;
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.invoke(binding.slot, ctx, &args)
    }));
    let message = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(message)) => message,
        Err(payload) => {
            let message = format!("host function panicked: {}", panic_message(payload.as_ref()));
            engine.abort(&message);
            message
        }
    };
    set_error(ctx, &message);
}

unsafe extern "C" fn drop_binding(app: *mut c_void) {
    if !app.is_null() {
        // SAFETY: `app` came from Box::into_raw in create_function_v2 and SQLite calls the
        // destructor exactly once.
        drop(unsafe { Box::from_raw(app.cast::<FunctionBinding>()) });
    }
}

fn set_error(ctx: *mut ffi::sqlite3_context, message: &str) {
    let len = c_int::try_from(message.len()).unwrap_or(c_int::MAX);
    // SAFETY: ctx is the live context of the current callback; SQLite copies the message.
    unsafe { ffi::sqlite3_result_error(ctx, message.as_ptr().cast::<c_char>(), len) };
}

fn length(bytes: &[u8]) -> Result<c_int, c_int> {
    c_int::try_from(bytes.len()).map_err(|_| SQLITE_TOOBIG)
}

impl Engine for NativeEngine {
    fn malloc(&self, size: u32) -> Ptr {
        self.heap.borrow_mut().malloc(size)
    }

    fn free(&self, ptr: Ptr) {
        self.heap.borrow_mut().free(ptr);
    }

    fn read_memory(&self, ptr: Ptr, buf: &mut [u8]) -> bool {
        self.heap.borrow().read(ptr, buf)
    }

    fn write_memory(&self, ptr: Ptr, bytes: &[u8]) -> bool {
        self.heap.borrow_mut().write(ptr, bytes)
    }

    fn memory_size(&self) -> usize {
        self.heap.borrow().size()
    }

    fn table_len(&self) -> u32 {
        u32::try_from(self.table.borrow().len()).unwrap_or(u32::MAX)
    }

    fn table_grow(&self, delta: u32) -> Option<u32> {
        let mut table = self.table.borrow_mut();
        let old = u32::try_from(table.len()).ok()?;
        let new = old.checked_add(delta)?;
        table.resize_with(new as usize, || None);
        Some(old)
    }

    fn table_set(&self, slot: u32, function: Option<HostFunction>) {
        if slot == 0 {
            return;
        }
        if let Some(entry) = self.table.borrow_mut().get_mut(slot as usize) {
            *entry = function;
        }
    }

    fn open(&self, filename: Ptr, db_out: Ptr) -> i32 {
        let Some(name) = self.read_c_string(filename) else {
            return SQLITE_MISUSE;
        };
        let Ok(path) = self.fs.host_path(&name.to_string_lossy()) else {
            return SQLITE_CANTOPEN;
        };
        let Ok(path) = CString::new(path.to_string_lossy().into_owned()) else {
            return SQLITE_CANTOPEN;
        };
        let mut raw = ptr::null_mut();
        // SAFETY: `path` is NUL-terminated and outlives the call.
        let rc = unsafe {
            ffi::sqlite3_open_v2(path.as_ptr(), &mut raw, OPEN_READWRITE | OPEN_CREATE, ptr::null())
        };
        let handle = if raw.is_null() {
            0
        } else {
            self.databases.borrow_mut().insert(raw)
        };
        self.write_handle(db_out, handle);
        rc
    }

    fn close_v2(&self, db: Handle) -> i32 {
        if db == 0 {
            return SQLITE_OK;
        }
        let Some(raw) = self.databases.borrow_mut().remove(db) else {
            return SQLITE_MISUSE;
        };
        if let Some(ptr) = self.errmsgs.borrow_mut().remove(&db) {
            self.heap.borrow_mut().free(ptr);
        }
        // SAFETY: `raw` came from sqlite3_open_v2 and is no longer reachable through a handle.
        unsafe { sqlite3_close_v2(raw) }
    }

    fn exec(&self, db: Handle, sql: Ptr, callback: u32, _arg: Ptr, errmsg_out: Ptr) -> i32 {
        if callback != 0 {
            return SQLITE_MISUSE;
        }
        let (Some(raw), Some(sql)) = (self.db_raw(db), self.read_c_string(sql)) else {
            return SQLITE_MISUSE;
        };
        self.write_handle(errmsg_out, 0);
        // SAFETY: `raw` is a live connection and `sql` is NUL-terminated.
        unsafe { ffi::sqlite3_exec(raw, sql.as_ptr(), None, ptr::null_mut(), ptr::null_mut()) }
    }

    fn changes(&self, db: Handle) -> i32 {
        match self.db_raw(db) {
            // SAFETY: `raw` is a live connection.
            Some(raw) => unsafe { ffi::sqlite3_changes(raw) },
            None => 0,
        }
    }

    fn errmsg(&self, db: Handle) -> Ptr {
        let message = match self.db_raw(db) {
            // SAFETY: `raw` is a live connection; the message is copied before any other call.
            Some(raw) => unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(raw)) }
                .to_bytes()
                .to_vec(),
            // SAFETY: sqlite3_errstr returns a static string.
            None => unsafe { CStr::from_ptr(ffi::sqlite3_errstr(SQLITE_MISUSE)) }
                .to_bytes()
                .to_vec(),
        };
        let ptr = self.copy_out(&message, true);
        if let Some(previous) = self.errmsgs.borrow_mut().insert(db, ptr) {
            self.heap.borrow_mut().free(previous);
        }
        ptr
    }

    fn register_extension_functions(&self, db: Handle) -> i32 {
        match self.db_raw(db) {
            // SAFETY: `raw` is a live connection.
            Some(raw) => unsafe { extensions::register(raw) },
            None => SQLITE_MISUSE,
        }
    }

    fn prepare_v2(&self, db: Handle, sql: Ptr, nbyte: i32, stmt_out: Ptr, tail_out: Ptr) -> i32 {
        let Some(raw_db) = self.db_raw(db) else {
            return SQLITE_MISUSE;
        };
        let Some(mut text) = self.read_input(sql, nbyte) else {
            return SQLITE_MISUSE;
        };
        let Ok(len) = length(&text) else {
            return SQLITE_TOOBIG;
        };
        text.push(0);
        let base = text.as_ptr() as usize;
        let mut raw_stmt = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        // SAFETY: `text` holds `len` bytes plus a terminator and outlives the call.
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(raw_db, text.as_ptr().cast::<c_char>(), len, &mut raw_stmt, &mut tail)
        };
        let consumed = if tail.is_null() {
            text.len() - 1
        } else {
            (tail as usize).saturating_sub(base)
        };
        let handle = if raw_stmt.is_null() {
            0
        } else {
            self.statements.borrow_mut().insert(NativeStatement {
                raw: raw_stmt,
                scratch: Vec::new(),
            })
        };
        self.write_handle(stmt_out, handle);
        #[allow(clippy::cast_possible_truncation)]
        self.write_handle(tail_out, sql + consumed as u32);
        rc
    }

    fn bind_text(&self, stmt: Handle, index: i32, text: Ptr, nbyte: i32, _destructor: i32) -> i32 {
        let Some(raw) = self.stmt_raw(stmt) else {
            return SQLITE_MISUSE;
        };
        if text == 0 {
            // SAFETY: `raw` is a live statement.
            return unsafe { ffi::sqlite3_bind_null(raw, index) };
        }
        let Some(bytes) = self.read_input(text, nbyte) else {
            return SQLITE_MISUSE;
        };
        let len = match length(&bytes) {
            Ok(len) => len,
            Err(rc) => return rc,
        };
        // SAFETY: SQLITE_TRANSIENT makes SQLite copy `bytes` before returning.
        unsafe {
            ffi::sqlite3_bind_text(raw, index, bytes.as_ptr().cast::<c_char>(), len, ffi::SQLITE_TRANSIENT())
        }
    }

    fn bind_blob(&self, stmt: Handle, index: i32, blob: Ptr, nbyte: i32, _destructor: i32) -> i32 {
        let Some(raw) = self.stmt_raw(stmt) else {
            return SQLITE_MISUSE;
        };
        if blob == 0 {
            // SAFETY: `raw` is a live statement.
            return unsafe { ffi::sqlite3_bind_null(raw, index) };
        }
        let Some(bytes) = self.read_input(blob, nbyte.max(0)) else {
            return SQLITE_MISUSE;
        };
        let len = match length(&bytes) {
            Ok(len) => len,
            Err(rc) => return rc,
        };
        // SAFETY: SQLITE_TRANSIENT makes SQLite copy `bytes` before returning.
        unsafe {
            ffi::sqlite3_bind_blob(raw, index, bytes.as_ptr().cast::<c_void>(), len, ffi::SQLITE_TRANSIENT())
        }
    }

    fn bind_double(&self, stmt: Handle, index: i32, value: f64) -> i32 {
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement.
            Some(raw) => unsafe { ffi::sqlite3_bind_double(raw, index, value) },
            None => SQLITE_MISUSE,
        }
    }

    fn bind_int(&self, stmt: Handle, index: i32, value: i32) -> i32 {
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement.
            Some(raw) => unsafe { ffi::sqlite3_bind_int(raw, index, value) },
            None => SQLITE_MISUSE,
        }
    }

    fn bind_int64(&self, stmt: Handle, index: i32, value: i64) -> i32 {
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement.
            Some(raw) => unsafe { ffi::sqlite3_bind_int64(raw, index, value) },
            None => SQLITE_MISUSE,
        }
    }

    fn bind_null(&self, stmt: Handle, index: i32) -> i32 {
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement.
            Some(raw) => unsafe { ffi::sqlite3_bind_null(raw, index) },
            None => SQLITE_MISUSE,
        }
    }

    fn bind_parameter_index(&self, stmt: Handle, name: Ptr) -> i32 {
        let (Some(raw), Some(name)) = (self.stmt_raw(stmt), self.read_c_string(name)) else {
            return 0;
        };
        // SAFETY: `raw` is a live statement and `name` is NUL-terminated.
        unsafe { ffi::sqlite3_bind_parameter_index(raw, name.as_ptr()) }
    }

    fn step(&self, stmt: Handle) -> i32 {
        self.clear_scratch(stmt);
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement; no RefCell borrow is held while SQLite
            // calls back into host functions.
            Some(raw) => unsafe { ffi::sqlite3_step(raw) },
            None => SQLITE_MISUSE,
        }
    }

    fn data_count(&self, stmt: Handle) -> i32 {
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement.
            Some(raw) => unsafe { ffi::sqlite3_data_count(raw) },
            None => 0,
        }
    }

    fn column_count(&self, stmt: Handle) -> i32 {
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement.
            Some(raw) => unsafe { ffi::sqlite3_column_count(raw) },
            None => 0,
        }
    }

    fn column_type(&self, stmt: Handle, column: i32) -> i32 {
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement; SQLite range-checks `column`.
            Some(raw) => unsafe { ffi::sqlite3_column_type(raw, column) },
            None => crate::engine::SQLITE_NULL,
        }
    }

    fn column_text(&self, stmt: Handle, column: i32) -> Ptr {
        let Some(raw) = self.stmt_raw(stmt) else {
            return 0;
        };
        // SAFETY: the text pointer stays valid until the next column call on `raw`; it is
        // copied out before that.
        let bytes = unsafe {
            let text = ffi::sqlite3_column_text(raw, column);
            if text.is_null() {
                return 0;
            }
            let len = usize::try_from(ffi::sqlite3_column_bytes(raw, column)).unwrap_or(0);
            std::slice::from_raw_parts(text, len).to_vec()
        };
        self.column_copy(stmt, &bytes, true)
    }

    fn column_blob(&self, stmt: Handle, column: i32) -> Ptr {
        let Some(raw) = self.stmt_raw(stmt) else {
            return 0;
        };
        // SAFETY: as for column_text.
        let bytes = unsafe {
            let blob = ffi::sqlite3_column_blob(raw, column);
            let len = usize::try_from(ffi::sqlite3_column_bytes(raw, column)).unwrap_or(0);
            if blob.is_null() || len == 0 {
                return 0;
            }
            std::slice::from_raw_parts(blob.cast::<u8>(), len).to_vec()
        };
        self.column_copy(stmt, &bytes, false)
    }

    fn column_bytes(&self, stmt: Handle, column: i32) -> i32 {
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement.
            Some(raw) => unsafe { ffi::sqlite3_column_bytes(raw, column) },
            None => 0,
        }
    }

    fn column_double(&self, stmt: Handle, column: i32) -> f64 {
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement.
            Some(raw) => unsafe { ffi::sqlite3_column_double(raw, column) },
            None => 0.0,
        }
    }

    fn column_int64(&self, stmt: Handle, column: i32) -> i64 {
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement.
            Some(raw) => unsafe { ffi::sqlite3_column_int64(raw, column) },
            None => 0,
        }
    }

    fn column_name(&self, stmt: Handle, column: i32) -> Ptr {
        let Some(raw) = self.stmt_raw(stmt) else {
            return 0;
        };
        // SAFETY: the name is valid until the statement is finalized; copied immediately.
        let bytes = unsafe {
            let name = ffi::sqlite3_column_name(raw, column);
            if name.is_null() {
                return 0;
            }
            CStr::from_ptr(name).to_bytes().to_vec()
        };
        self.column_copy(stmt, &bytes, true)
    }

    fn reset(&self, stmt: Handle) -> i32 {
        self.clear_scratch(stmt);
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement.
            Some(raw) => unsafe { ffi::sqlite3_reset(raw) },
            None => SQLITE_MISUSE,
        }
    }

    fn clear_bindings(&self, stmt: Handle) -> i32 {
        match self.stmt_raw(stmt) {
            // SAFETY: `raw` is a live statement.
            Some(raw) => unsafe { ffi::sqlite3_clear_bindings(raw) },
            None => SQLITE_MISUSE,
        }
    }

    fn finalize(&self, stmt: Handle) -> i32 {
        if stmt == 0 {
            return SQLITE_OK;
        }
        let Some(entry) = self.statements.borrow_mut().remove(stmt) else {
            return SQLITE_MISUSE;
        };
        {
            let mut heap = self.heap.borrow_mut();
            for ptr in entry.scratch {
                heap.free(ptr);
            }
        }
        // SAFETY: the statement was removed from the registry, so this is its only finalize.
        unsafe { ffi::sqlite3_finalize(entry.raw) }
    }

    fn create_function_v2(
        &self,
        db: Handle,
        name: Ptr,
        n_arg: i32,
        text_rep: i32,
        _app: Ptr,
        x_func: u32,
        x_step: u32,
        x_final: u32,
        x_destroy: u32,
    ) -> i32 {
        // Only scalar functions; the module owns the destructor.
        if x_step != 0 || x_final != 0 || x_destroy != 0 {
            return SQLITE_MISUSE;
        }
        let (Some(raw), Some(name)) = (self.db_raw(db), self.read_c_string(name)) else {
            return SQLITE_MISUSE;
        };
        if x_func == 0 {
            // SAFETY: `raw` is a live connection; a missing xFunc deletes the function.
            return unsafe {
                ffi::sqlite3_create_function_v2(
                    raw,
                    name.as_ptr(),
                    n_arg,
                    text_rep,
                    ptr::null_mut(),
                    None,
                    None,
                    None,
                    None,
                )
            };
        }
        let binding = Box::new(FunctionBinding {
            engine: self.this.clone(),
            slot: x_func,
        });
        // SAFETY: SQLite takes ownership of the binding and releases it through
        // drop_binding, including when registration fails.
        unsafe {
            ffi::sqlite3_create_function_v2(
                raw,
                name.as_ptr(),
                n_arg,
                text_rep,
                Box::into_raw(binding).cast::<c_void>(),
                Some(call_host_function),
                None,
                None,
                Some(drop_binding),
            )
        }
    }

    fn value_type(&self, value: Handle) -> i32 {
        match self.value_raw(value) {
            // SAFETY: value handles only exist while their callback runs.
            Some(raw) => unsafe { ffi::sqlite3_value_type(raw) },
            None => crate::engine::SQLITE_NULL,
        }
    }

    fn value_text(&self, value: Handle) -> Ptr {
        let Some(raw) = self.value_raw(value) else {
            return 0;
        };
        // SAFETY: `raw` is live for the current callback; bytes are copied out immediately.
        let bytes = unsafe {
            let text = ffi::sqlite3_value_text(raw);
            if text.is_null() {
                return 0;
            }
            let len = usize::try_from(ffi::sqlite3_value_bytes(raw)).unwrap_or(0);
            std::slice::from_raw_parts(text, len).to_vec()
        };
        self.frame_copy(&bytes, true)
    }

    fn value_blob(&self, value: Handle) -> Ptr {
        let Some(raw) = self.value_raw(value) else {
            return 0;
        };
        // SAFETY: as for value_text.
        let bytes = unsafe {
            let blob = ffi::sqlite3_value_blob(raw);
            let len = usize::try_from(ffi::sqlite3_value_bytes(raw)).unwrap_or(0);
            if blob.is_null() || len == 0 {
                return 0;
            }
            std::slice::from_raw_parts(blob.cast::<u8>(), len).to_vec()
        };
        self.frame_copy(&bytes, false)
    }

    fn value_bytes(&self, value: Handle) -> i32 {
        match self.value_raw(value) {
            // SAFETY: `raw` is live for the current callback.
            Some(raw) => unsafe { ffi::sqlite3_value_bytes(raw) },
            None => 0,
        }
    }

    fn value_double(&self, value: Handle) -> f64 {
        match self.value_raw(value) {
            // SAFETY: `raw` is live for the current callback.
            Some(raw) => unsafe { ffi::sqlite3_value_double(raw) },
            None => 0.0,
        }
    }

    fn value_int64(&self, value: Handle) -> i64 {
        match self.value_raw(value) {
            // SAFETY: `raw` is live for the current callback.
            Some(raw) => unsafe { ffi::sqlite3_value_int64(raw) },
            None => 0,
        }
    }

    fn result_null(&self, ctx: Handle) {
        if let Some(raw) = self.ctx_raw(ctx) {
            // SAFETY: `raw` is the live context of the current callback.
            unsafe { ffi::sqlite3_result_null(raw) };
        }
    }

    fn result_int(&self, ctx: Handle, value: i32) {
        if let Some(raw) = self.ctx_raw(ctx) {
            // SAFETY: `raw` is the live context of the current callback.
            unsafe { ffi::sqlite3_result_int(raw, value) };
        }
    }

    fn result_int64(&self, ctx: Handle, value: i64) {
        if let Some(raw) = self.ctx_raw(ctx) {
            // SAFETY: `raw` is the live context of the current callback.
            unsafe { ffi::sqlite3_result_int64(raw, value) };
        }
    }

    fn result_double(&self, ctx: Handle, value: f64) {
        if let Some(raw) = self.ctx_raw(ctx) {
            // SAFETY: `raw` is the live context of the current callback.
            unsafe { ffi::sqlite3_result_double(raw, value) };
        }
    }

    fn result_text(&self, ctx: Handle, text: Ptr, nbyte: i32, _destructor: i32) {
        let Some(raw) = self.ctx_raw(ctx) else {
            return;
        };
        let Some(bytes) = (text != 0).then(|| self.read_input(text, nbyte)).flatten() else {
            // SAFETY: `raw` is the live context of the current callback.
            unsafe { ffi::sqlite3_result_null(raw) };
            return;
        };
        match length(&bytes) {
            // SAFETY: SQLITE_TRANSIENT makes SQLite copy `bytes` before returning.
            Ok(len) => unsafe {
                ffi::sqlite3_result_text(raw, bytes.as_ptr().cast::<c_char>(), len, ffi::SQLITE_TRANSIENT());
            },
            // SAFETY: `raw` is the live context of the current callback.
            Err(_) => unsafe { ffi::sqlite3_result_error_toobig(raw) },
        }
    }

    fn result_blob(&self, ctx: Handle, blob: Ptr, nbyte: i32, _destructor: i32) {
        let Some(raw) = self.ctx_raw(ctx) else {
            return;
        };
        let Some(bytes) = (blob != 0).then(|| self.read_input(blob, nbyte.max(0))).flatten() else {
            // SAFETY: `raw` is the live context of the current callback.
            unsafe { ffi::sqlite3_result_null(raw) };
            return;
        };
        match length(&bytes) {
            // SAFETY: SQLITE_TRANSIENT makes SQLite copy `bytes` before returning.
            Ok(len) => unsafe {
                ffi::sqlite3_result_blob(raw, bytes.as_ptr().cast::<c_void>(), len, ffi::SQLITE_TRANSIENT());
            },
            // SAFETY: `raw` is the live context of the current callback.
            Err(_) => unsafe { ffi::sqlite3_result_error_toobig(raw) },
        }
    }

    fn result_error(&self, ctx: Handle, message: Ptr, nbyte: i32) {
        let Some(raw) = self.ctx_raw(ctx) else {
            return;
        };
        match (message != 0).then(|| self.read_input(message, nbyte)).flatten() {
            Some(bytes) => {
                let len = c_int::try_from(bytes.len()).unwrap_or(c_int::MAX);
                // SAFETY: SQLite copies the message before returning.
                unsafe { ffi::sqlite3_result_error(raw, bytes.as_ptr().cast::<c_char>(), len) };
            }
            // SAFETY: `raw` is the live context of the current callback.
            None => unsafe { ffi::sqlite3_result_error_nomem(raw) },
        }
    }

    fn fs(&self) -> &dyn VirtualFs {
        &self.fs
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        for statement in self.statements.get_mut().drain() {
            // SAFETY: every registered statement is finalized exactly once, here.
            unsafe { ffi::sqlite3_finalize(statement.raw) };
        }
        for raw in self.databases.get_mut().drain() {
            // SAFETY: every registered connection is closed exactly once, here.
            let rc = unsafe { sqlite3_close_v2(raw) };
            if rc != SQLITE_OK {
                tracing::warn!(rc, "closing connection on engine drop failed");
            }
        }
    }
}
