use std::path::PathBuf;

use clap::Parser;
use dotenv::dotenv;
use tokio::runtime;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use framewire::{
    global_config, setup_tracing, AppError, AppResult, Endpoint, FramedServer, ServerConfig,
    Shutdown, SocketEvent, GLOBAL_CONFIG,
};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    let _tracing_guard = setup_tracing()?;

    let commandline: CommandLine = CommandLine::parse();
    let server_config = match commandline.conf.as_ref() {
        Some(path) => ServerConfig::set_up_config(PathBuf::from(path))?,
        None => {
            let default_path = PathBuf::from("./conf.toml");
            if default_path.exists() {
                ServerConfig::set_up_config(default_path)?
            } else {
                ServerConfig::default()
            }
        }
    };
    GLOBAL_CONFIG
        .set(server_config)
        .expect("set server config failed");

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", global_config());
        return Ok(());
    }

    rt.block_on(run_echo_server())
}

/// Echo server: every Full-mode message received on any connection is sent
/// straight back on the same connection.
async fn run_echo_server() -> AppResult<()> {
    let config = global_config();
    let endpoint = Endpoint::from_config(&config.network);
    let listener = match endpoint.listen(config.network.backlog).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(
                "Failed to bind server to address: {} - Error: {}",
                endpoint.address(),
                err
            );
            return Err(err);
        }
    };

    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

    let server = FramedServer::new(
        listener,
        config.network.clone(),
        notify_shutdown.clone(),
        shutdown_complete_tx,
    );

    start_echo_workers(&server, notify_shutdown.clone());

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = signal::ctrl_c() => {
            info!("get shutdown signal");
        }
    }

    server.stop();
    notify_shutdown
        .send(())
        .map_err(|err| AppError::ChannelSendError(err.to_string()))?;
    drop(server);
    drop(notify_shutdown);

    // wait for every connection task to finish its drain
    shutdown_complete_rx.recv().await;
    info!("server shutdown complete");
    Ok(())
}

fn start_echo_workers(server: &FramedServer, notify_shutdown: broadcast::Sender<()>) {
    let pool = &global_config().echo_worker_pool;
    let num_workers = if pool.num_workers > 0 {
        pool.num_workers
    } else {
        num_cpus::get()
    };

    for i in 0..num_workers {
        let events = server.events();
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            debug!("echo worker {} started", i);
            loop {
                let server_event = tokio::select! {
                    _ = shutdown.recv() => break,
                    event = events.recv() => match event {
                        Ok(event) => event,
                        Err(_) => break,
                    },
                };
                match server_event.event {
                    SocketEvent::Accepted => {
                        info!(
                            "connection {} accepted from {}",
                            server_event.connection.id(),
                            server_event.connection.peer_addr()
                        );
                    }
                    SocketEvent::Message { payload } => {
                        if let Err(err) = server_event.connection.send(payload).await {
                            error!(
                                "echo on connection {} failed: {}",
                                server_event.connection.id(),
                                err
                            );
                        }
                    }
                    SocketEvent::StateChanged { state, .. } => {
                        debug!(
                            "connection {} state {:?}",
                            server_event.connection.id(),
                            state
                        );
                    }
                    SocketEvent::Chunk { .. } => {
                        // streamed payloads are not echoed
                    }
                }
            }
            debug!("echo worker {} exited", i);
        });
    }
}
