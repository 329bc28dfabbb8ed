pub use app_error::{AppError, AppResult};
pub use config::{global_config, EchoWorkerPool, NetworkConfig, ServerConfig, GLOBAL_CONFIG};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
