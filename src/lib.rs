mod net;
mod service;

pub use net::BufferPool;
pub use net::Connection;
pub use net::Endpoint;
pub use net::FramedClient;
pub use net::FramedServer;
pub use net::IoEngine;
pub use net::SendElement;
pub use net::ServerEvent;
pub use net::SocketEvent;
pub use net::{ChannelState, Lifecycle};
pub use net::{FrameEvent, FrameHeader, FrameMode, Framer, FRAME_HEADER_LEN};
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, EchoWorkerPool,
    NetworkConfig, ServerConfig, Shutdown, GLOBAL_CONFIG,
};
