mod core;
mod functions;
mod query;

pub(crate) use core::DatabaseShared;
pub use core::Database;
