//! Scalar functions registered on every connection the module opens.

use std::ffi::{CStr, c_char, c_int};
use std::ptr;

use rusqlite::ffi;

use crate::engine::{SQLITE_INTEGER, SQLITE_NULL, SQLITE_OK, SQLITE_UTF8};

const SQLITE_DETERMINISTIC: c_int = 0x0000_0800;

type ScalarFn = unsafe extern "C" fn(*mut ffi::sqlite3_context, c_int, *mut *mut ffi::sqlite3_value);

const FUNCTIONS: &[(&CStr, c_int, ScalarFn)] = &[
    (c"reverse", 1, reverse),
    (c"padl", 2, padl),
    (c"padr", 2, padr),
    (c"padc", 2, padc),
    (c"square", 1, square),
];

/// # Safety
///
/// `db` must be a live connection.
pub(super) unsafe fn register(db: *mut ffi::sqlite3) -> c_int {
    for &(name, n_arg, func) in FUNCTIONS {
        // SAFETY: `db` is live per the caller; `name` is a static C string.
        let rc = unsafe {
            ffi::sqlite3_create_function_v2(
                db,
                name.as_ptr(),
                n_arg,
                SQLITE_UTF8 | SQLITE_DETERMINISTIC,
                ptr::null_mut(),
                Some(func),
                None,
                None,
                None,
            )
        };
        if rc != SQLITE_OK {
            return rc;
        }
    }
    SQLITE_OK
}

/// Argument `i`, or `None` when it is SQL NULL.
///
/// # Safety
///
/// `argv` must hold more than `i` live values.
unsafe fn arg(argv: *mut *mut ffi::sqlite3_value, i: usize) -> Option<*mut ffi::sqlite3_value> {
    // SAFETY: guaranteed by the caller.
    let value = unsafe { *argv.add(i) };
    // SAFETY: `value` is live for the current callback.
    (unsafe { ffi::sqlite3_value_type(value) } != SQLITE_NULL).then_some(value)
}

/// # Safety
///
/// `value` must be live for the current callback.
unsafe fn text(value: *mut ffi::sqlite3_value) -> String {
    // SAFETY: guaranteed by the caller; the bytes are copied before returning.
    unsafe {
        let text = ffi::sqlite3_value_text(value);
        if text.is_null() {
            return String::new();
        }
        let len = usize::try_from(ffi::sqlite3_value_bytes(value)).unwrap_or(0);
        String::from_utf8_lossy(std::slice::from_raw_parts(text, len)).into_owned()
    }
}

fn result_text(ctx: *mut ffi::sqlite3_context, text: &str) {
    let len = c_int::try_from(text.len()).unwrap_or(c_int::MAX);
    // SAFETY: `ctx` is the live context of the current callback; SQLite copies `text`.
    unsafe {
        ffi::sqlite3_result_text(ctx, text.as_ptr().cast::<c_char>(), len, ffi::SQLITE_TRANSIENT());
    }
}

fn result_null(ctx: *mut ffi::sqlite3_context) {
    // SAFETY: `ctx` is the live context of the current callback.
    unsafe { ffi::sqlite3_result_null(ctx) };
}

unsafe extern "C" fn reverse(
    ctx: *mut ffi::sqlite3_context,
    _argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    // SAFETY: registered with exactly one argument.
    match unsafe { arg(argv, 0) } {
        // SAFETY: the value is live for this callback.
        Some(value) => result_text(ctx, &unsafe { text(value) }.chars().rev().collect::<String>()),
        None => result_null(ctx),
    }
}

#[derive(Clone, Copy)]
enum Pad {
    Left,
    Right,
    Center,
}

/// Pad the first argument with spaces to the character width given by the second.
///
/// # Safety
///
/// `argv` must hold two live values.
unsafe fn pad(ctx: *mut ffi::sqlite3_context, argv: *mut *mut ffi::sqlite3_value, side: Pad) {
    // SAFETY: registered with exactly two arguments.
    let (Some(value), Some(width)) = (unsafe { arg(argv, 0) }, unsafe { arg(argv, 1) }) else {
        result_null(ctx);
        return;
    };
    // SAFETY: both values are live for this callback.
    let (input, width) = unsafe { (text(value), ffi::sqlite3_value_int64(width)) };
    let Ok(width) = usize::try_from(width) else {
        // SAFETY: `ctx` is the live context of the current callback.
        unsafe { ffi::sqlite3_result_error(ctx, c"domain error".as_ptr(), -1) };
        return;
    };
    let missing = width.saturating_sub(input.chars().count());
    // SAFETY: `ctx` is the live context of the current callback.
    let limit = unsafe {
        ffi::sqlite3_limit(ffi::sqlite3_context_db_handle(ctx), ffi::SQLITE_LIMIT_LENGTH, -1)
    };
    let total = input.len().saturating_add(missing);
    if usize::try_from(limit).is_ok_and(|limit| total > limit) {
        // SAFETY: `ctx` is the live context of the current callback.
        unsafe { ffi::sqlite3_result_error_toobig(ctx) };
        return;
    }
    let (left, right) = match side {
        Pad::Left => (missing, 0),
        Pad::Right => (0, missing),
        Pad::Center => (missing / 2, missing - missing / 2),
    };
    let mut padded = String::new();
    if padded.try_reserve_exact(total).is_err() {
        // SAFETY: `ctx` is the live context of the current callback.
        unsafe { ffi::sqlite3_result_error_nomem(ctx) };
        return;
    }
    padded.extend(std::iter::repeat_n(' ', left));
    padded.push_str(&input);
    padded.extend(std::iter::repeat_n(' ', right));
    result_text(ctx, &padded);
}

unsafe extern "C" fn padl(ctx: *mut ffi::sqlite3_context, _argc: c_int, argv: *mut *mut ffi::sqlite3_value) {
    // SAFETY: registered with exactly two arguments.
    unsafe { pad(ctx, argv, Pad::Left) }
}

unsafe extern "C" fn padr(ctx: *mut ffi::sqlite3_context, _argc: c_int, argv: *mut *mut ffi::sqlite3_value) {
    // SAFETY: registered with exactly two arguments.
    unsafe { pad(ctx, argv, Pad::Right) }
}

unsafe extern "C" fn padc(ctx: *mut ffi::sqlite3_context, _argc: c_int, argv: *mut *mut ffi::sqlite3_value) {
    // SAFETY: registered with exactly two arguments.
    unsafe { pad(ctx, argv, Pad::Center) }
}

unsafe extern "C" fn square(
    ctx: *mut ffi::sqlite3_context,
    _argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    // SAFETY: registered with exactly one argument.
    let Some(value) = (unsafe { arg(argv, 0) }) else {
        result_null(ctx);
        return;
    };
    // SAFETY: the value and context are live for this callback.
    unsafe {
        if ffi::sqlite3_value_type(value) == SQLITE_INTEGER {
            let n = ffi::sqlite3_value_int64(value);
            match n.checked_mul(n) {
                Some(squared) => ffi::sqlite3_result_int64(ctx, squared),
                #[allow(clippy::cast_precision_loss)]
                None => ffi::sqlite3_result_double(ctx, (n as f64) * (n as f64)),
            }
        } else {
            let x = ffi::sqlite3_value_double(value);
            ffi::sqlite3_result_double(ctx, x * x);
        }
    }
}
