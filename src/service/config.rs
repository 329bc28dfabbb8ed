extern crate config as _;

use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<ServerConfig> = OnceCell::new();
pub fn global_config() -> &'static ServerConfig {
    GLOBAL_CONFIG.get().unwrap()
}

/// Network-facing knobs for one engine instance.
///
/// The library APIs take this struct explicitly; `GLOBAL_CONFIG` exists for
/// the server binary, which loads it once from a TOML file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// TCP keep-alive interval in seconds, 0 leaves the OS default in place.
    pub keep_alive_secs: u64,
    /// Upper bound on concurrently accepted connections (server).
    pub max_connection: usize,
    /// Listen backlog handed to the OS (server).
    pub backlog: u32,
    /// Capacity of the per-read receive buffer.
    pub conn_read_buffer_size: usize,
    /// Largest payload length a frame header may declare.
    pub max_frame_size: u32,
    /// Capacity of the per-connection / server event channels.
    pub event_channel_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 6810,
            keep_alive_secs: 0,
            max_connection: 1024,
            backlog: 128,
            conn_read_buffer_size: 4 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            event_channel_capacity: 256,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct EchoWorkerPool {
    /// 0 falls back to the number of CPUs.
    pub num_workers: usize,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub echo_worker_pool: EchoWorkerPool,
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;

        Ok(server_config)
    }
}
