//! User-defined scalar functions: the trampoline the engine calls through its function
//! table, and the conversions on either side of it.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use serde_json::Value as JsonValue;

use crate::bridge::MemoryBridge;
use crate::engine::{
    Engine, Handle, HostFunction, Ptr, SQLITE_BLOB, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_TEXT,
    SQLITE_TRANSIENT,
};
use crate::error::{FunctionError, SqlBridgeError};
use crate::types::{Value, json_bytes};

/// Declared argument count of a user function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(u8),
    /// Any number of arguments.
    Variadic,
}

impl Arity {
    #[must_use]
    pub fn as_raw(self) -> i32 {
        match self {
            Arity::Exact(n) => i32::from(n),
            Arity::Variadic => -1,
        }
    }
}

impl From<u8> for Arity {
    fn from(n: u8) -> Self {
        Arity::Exact(n)
    }
}

/// Values a user function may return.
pub trait FunctionOutput {
    /// # Errors
    ///
    /// Returns `SqlBridgeError::WrongReturnType` when the value has no engine encoding.
    fn into_value(self) -> Result<Value, SqlBridgeError>;
}

impl FunctionOutput for Value {
    fn into_value(self) -> Result<Value, SqlBridgeError> {
        Ok(self)
    }
}

impl FunctionOutput for () {
    fn into_value(self) -> Result<Value, SqlBridgeError> {
        Ok(Value::Null)
    }
}

macro_rules! output_via_from {
    ($($ty:ty),*) => {
        $(
            impl FunctionOutput for $ty {
                fn into_value(self) -> Result<Value, SqlBridgeError> {
                    Ok(Value::from(self))
                }
            }
        )*
    };
}

output_via_from!(i64, i32, f64, bool, String, &str, Vec<u8>);

impl<T: FunctionOutput> FunctionOutput for Option<T> {
    fn into_value(self) -> Result<Value, SqlBridgeError> {
        self.map_or(Ok(Value::Null), FunctionOutput::into_value)
    }
}

impl FunctionOutput for JsonValue {
    fn into_value(self) -> Result<Value, SqlBridgeError> {
        match &self {
            JsonValue::Array(items) => json_bytes(items)
                .map(Value::Blob)
                .ok_or_else(|| SqlBridgeError::WrongReturnType(self.to_string())),
            JsonValue::Object(_) => Err(SqlBridgeError::WrongReturnType(self.to_string())),
            _ => Value::from_json(&self),
        }
    }
}

pub(crate) type ScalarFunction = Box<dyn FnMut(&[Value]) -> Result<Value, FunctionError>>;

/// Wrap a typed callable into the uniform boxed form.
pub(crate) fn boxed<F, R>(mut callable: F) -> ScalarFunction
where
    F: FnMut(&[Value]) -> Result<R, FunctionError> + 'static,
    R: FunctionOutput,
{
    Box::new(move |args: &[Value]| -> Result<Value, FunctionError> {
        Ok(callable(args)?.into_value()?)
    })
}

/// Build the table entry that runs `callable` for the engine.
///
/// The callable never unwinds into the engine: failures and panics become error results
/// on the call's result context.
pub(crate) fn trampoline(
    engine: Weak<dyn Engine>,
    name: String,
    callable: ScalarFunction,
) -> HostFunction {
    let callable = RefCell::new(callable);
    Rc::new(move |ctx: Handle, argc: i32, argv: Ptr| {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        let engine = &*engine;
        let written = invoke(engine, &name, &callable, argc, argv)
            .and_then(|value| write_result(engine, ctx, &value).map_err(FunctionError::from));
        if let Err(err) = written {
            write_error(engine, ctx, err.message());
        }
    })
}

fn invoke(
    engine: &dyn Engine,
    name: &str,
    callable: &RefCell<ScalarFunction>,
    argc: i32,
    argv: Ptr,
) -> Result<Value, FunctionError> {
    let args = decode_arguments(engine, argc, argv)?;
    let mut callable = callable
        .try_borrow_mut()
        .map_err(|_| FunctionError::new(format!("user function {name} called recursively")))?;
    match panic::catch_unwind(AssertUnwindSafe(|| (*callable)(&args))) {
        Ok(result) => result,
        Err(payload) => Err(FunctionError::new(format!(
            "panic in user function {name}: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

/// Decode `argc` argument-value handles stored at `argv`.
///
/// # Errors
///
/// Returns `SqlBridgeError::MemoryAccess` if `argv` or a value copy is out of bounds.
pub fn decode_arguments(
    engine: &dyn Engine,
    argc: i32,
    argv: Ptr,
) -> Result<Vec<Value>, SqlBridgeError> {
    let bridge = MemoryBridge::new(engine);
    let count = u32::try_from(argc).unwrap_or(0);
    (0..count)
        .map(|i| {
            let handle = bridge.read_u32(argv + 4 * i)?;
            decode_value(engine, bridge, handle)
        })
        .collect()
}

fn decode_value(
    engine: &dyn Engine,
    bridge: MemoryBridge<'_>,
    handle: Handle,
) -> Result<Value, SqlBridgeError> {
    Ok(match engine.value_type(handle) {
        SQLITE_INTEGER => Value::Integer(engine.value_int64(handle)),
        SQLITE_FLOAT => Value::Float(engine.value_double(handle)),
        SQLITE_TEXT => {
            let ptr = engine.value_text(handle);
            let len = usize::try_from(engine.value_bytes(handle)).unwrap_or(0);
            if ptr == 0 {
                Value::Text(String::new())
            } else {
                Value::Text(String::from_utf8_lossy(&bridge.read_blob(ptr, len)?).into_owned())
            }
        }
        SQLITE_BLOB => {
            let ptr = engine.value_blob(handle);
            let len = usize::try_from(engine.value_bytes(handle)).unwrap_or(0);
            Value::Blob(if ptr == 0 {
                Vec::new()
            } else {
                bridge.read_blob(ptr, len)?
            })
        }
        _ => Value::Null,
    })
}

/// Store `value` as the result of the call behind `ctx`.
///
/// # Errors
///
/// Returns `SqlBridgeError::OutOfMemory` if a text or blob cannot be staged in linear
/// memory, `SqlBridgeError::WrongReturnType` for text containing a NUL byte.
pub fn write_result(engine: &dyn Engine, ctx: Handle, value: &Value) -> Result<(), SqlBridgeError> {
    let mut scope = MemoryBridge::new(engine).scoped();
    match value {
        Value::Null => engine.result_null(ctx),
        Value::Bool(b) => engine.result_int(ctx, i32::from(*b)),
        Value::Integer(n) => engine.result_int64(ctx, *n),
        Value::Float(f) => engine.result_double(ctx, *f),
        Value::Text(text) => {
            if text.contains('\0') {
                return Err(SqlBridgeError::WrongReturnType(format!("{text:?}")));
            }
            let (ptr, len) = scope.write_utf8(text)?;
            engine.result_text(ctx, ptr, byte_len(len - 1), SQLITE_TRANSIENT);
        }
        Value::Blob(bytes) => {
            let ptr = scope.write_blob(bytes)?;
            engine.result_blob(ctx, ptr, byte_len(bytes.len()), SQLITE_TRANSIENT);
        }
    }
    Ok(())
}

fn write_error(engine: &dyn Engine, ctx: Handle, message: &str) {
    let bridge = MemoryBridge::new(engine);
    match bridge.write_utf8(message) {
        Ok((ptr, _)) => {
            engine.result_error(ctx, ptr, -1);
            bridge.free(ptr);
        }
        // A null message reports out-of-memory.
        Err(_) => engine.result_error(ctx, 0, 0),
    }
}

fn byte_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
