use clap::Parser;
use payeectl::{telemetry, Application, Config};

/// Resolves once the process is asked to stop (SIGTERM on unix, or
/// Ctrl+C anywhere).
async fn stop_requested() {
    use tokio::signal;

    let interrupt = async {
        signal::ctrl_c()
            .await
            .expect("ctrl-c handler installation failed");
    };

    #[cfg(unix)]
    let terminated = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation failed")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => tracing::info!("Ctrl+C: draining and stopping"),
        _ = terminated => tracing::info!("SIGTERM: draining and stopping"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = payeectl::config::Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry();
    tracing::debug!("{:?}", args);

    Application::new(config).await?.serve(stop_requested()).await
}
