//! Application layer: handler dispatch and connection bookkeeping.

pub mod dispatcher;
pub mod registry;

pub use dispatcher::{Dispatcher, Handler};
pub use registry::ConnectionRegistry;
