//! Infrastructure layer: everything that touches sockets, tasks or files.

pub mod client;
pub mod connection;
pub mod frame_io;
pub mod server;
pub mod storage;
