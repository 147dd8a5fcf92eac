mod app;
mod routes;
mod server;

use crate::app::{ApiConfig, App};
use payments_worker::signal::shutdown_signal;
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    // Initialize tracing with default level WARN, overridable via RUST_LOG
    {
        use tracing_subscriber::{EnvFilter, fmt};
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt().with_env_filter(env_filter).try_init();
    }

    let config = ApiConfig::from_env()?;
    let app = Arc::new(App::connect(&config).await?);

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::warn!(addr = %config.listen_addr, "Listening");

    server::serve(listener, app, shutdown_signal()).await;
    Ok(())
}
