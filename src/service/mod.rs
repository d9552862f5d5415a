pub use app_error::{AppError, AppResult};
pub use config::{
    ConnectionConfig, HeartbeatConfig, HeartbeatMechanism, NetworkConfig, ServerConfig,
    WriterPoolConfig, DEFAULT_POOL_BUCKETS,
};
pub use server::Server;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod server;
mod shutdown;
mod tracing_config;
