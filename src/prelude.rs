//! Convenient imports for common functionality.

pub use crate::config::{EngineOptions, WorkerOptions};
pub use crate::database::Database;
pub use crate::engine::loader::Loader;
pub use crate::error::{FunctionError, SqlBridgeError};
pub use crate::function::{Arity, FunctionOutput};
pub use crate::module::Module;
pub use crate::results::{QueryResult, Row};
pub use crate::statement::Statement;
pub use crate::types::{Params, Value};
pub use crate::worker::{RowStream, WorkerClient};
