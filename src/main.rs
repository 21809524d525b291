use gamework::config::ServerConfig;
use gamework::signaling::{RendezvousServer, health};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::from_env()?;

    println!("   GameWork Rendezvous Server");
    println!("   Binding to {}", config.bind_addr);
    if let Some(addr) = &config.health_addr {
        println!("   Health check on http://{}/health", addr);
    }
    println!("   Press Ctrl+C to stop\n");

    let health_addr = config.health_addr.clone();
    let server = RendezvousServer::bind(config).await?;

    if let Some(addr) = health_addr {
        let stats = server.stats();
        let registry = server.registry();
        tokio::spawn(async move {
            if let Err(e) = health::serve(&addr, stats, registry).await {
                error!("Health endpoint on {} failed: {}", addr, e);
            }
        });
    }

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => println!("\n   Shutting down"),
    }
    Ok(())
}
