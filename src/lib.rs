//! Memory-safe SQLite access across a foreign memory boundary.
//!
//! The engine lives behind [`engine::Engine`]: raw functions over 32-bit addresses into
//! its own linear memory. [`bridge::MemoryBridge`] moves strings, blobs and scalars
//! across that boundary; [`Database`] and [`Statement`] build the public API on top,
//! [`Database::create_function`] lets SQL call back into Rust, and [`worker`] hosts a
//! database on its own thread behind an id-correlated message protocol.

pub mod bridge;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod function;
pub mod module;
pub mod prelude;
pub mod results;
pub mod statement;
pub mod types;
pub mod worker;

pub use config::{EngineOptions, EngineOptionsBuilder, WorkerOptions};
pub use database::Database;
pub use error::{FunctionError, SqlBridgeError};
pub use function::{Arity, FunctionOutput};
pub use module::Module;
pub use results::{QueryResult, Row};
pub use statement::Statement;
pub use types::{Params, Value};
pub use worker::{WorkerChannel, WorkerClient};

#[cfg(feature = "native")]
pub use engine::native::{DirectoryFs, NativeEngine};
