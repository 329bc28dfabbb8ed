use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dotenv::dotenv;

use super::AppResult;

/// Console-only tracing for tests and local runs.
pub fn setup_local_tracing() -> AppResult<()> {
    // pick up RUST_LOG from a .env file if present
    dotenv().ok();
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    Ok(())
}

/// Full tracing for the server binary: hourly-rolling log file plus stdout.
///
/// The returned guard must stay alive for the life of the process, dropping
/// it flushes and stops the non-blocking writer.
pub fn setup_tracing() -> AppResult<WorkerGuard> {
    let file_appender = tracing_appender::rolling::hourly("logs", "framewire.log");
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    Ok(worker_guard)
}
