use clap::Parser;
use log::{error, info, warn};
use server::app::QuizServer;
use server::config::{Args, ServerConfig};
use server::network::NetworkServer;
use server::persistence::{Persistence, RedisStore};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());

    // Redis is optional; without it nothing survives a restart
    let persistence = match &config.redis_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => {
                info!("Persisting to {}", url);
                Persistence::new(Arc::new(store))
            }
            Err(e) => {
                warn!("Redis unavailable ({}), running memory-only", e);
                Persistence::disabled()
            }
        },
        None => Persistence::disabled(),
    };

    let quiz_server = QuizServer::start(&config, persistence)?;
    let bus = quiz_server.bus();
    let network = NetworkServer::bind(&config, &bus, quiz_server.shutdown_token()).await?;

    tokio::select! {
        result = network.run() => {
            if let Err(e) = result {
                error!("Network server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    quiz_server.shutdown().await;
    Ok(())
}
