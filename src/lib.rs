pub mod buffer;
pub mod network;
pub mod service;

pub use buffer::{NocopyBuffer, Whence, WriterPool};
pub use network::{ConnState, Connection, ConnectionHandler, ConnectionManager, NoopHandler};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Server, ServerConfig, Shutdown,
};
