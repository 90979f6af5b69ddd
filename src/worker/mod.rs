//! Hosting a database on its own thread, driven by id-correlated messages.
//!
//! The engine and every handle into it stay on the worker thread. [`WorkerChannel`]
//! speaks the raw [`protocol`]; [`WorkerClient`] wraps it in typed calls.

mod connection;
mod dispatcher;
mod manager;
mod pending;
pub mod protocol;

pub use connection::{RowStream, WorkerClient};
pub use manager::WorkerChannel;
pub use protocol::{Action, Request, Response};
