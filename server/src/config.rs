use std::time::Duration;

use clap::Parser;

use crate::bus::DEFAULT_TOPIC_CAPACITY;

/// Command line arguments of the quiz server
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    pub port: u16,
    /// Redis connection string; runs memory-only when absent
    #[clap(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,
    /// Seconds a session may stay idle before it is reaped
    #[clap(long, default_value = "3600")]
    pub session_timeout: u64,
    /// Seconds between reaper sweeps
    #[clap(long, default_value = "30")]
    pub reaper_interval: u64,
    #[clap(long, env = "ADMIN_USER", default_value = "admin")]
    pub admin_user: String,
    #[clap(long, env = "ADMIN_PASSWORD", default_value = "admin")]
    pub admin_password: String,
    /// Slots per bus topic
    #[clap(long, default_value = "20")]
    pub topic_capacity: usize,
    #[clap(long, default_value = "1024")]
    pub max_clients: usize,
    /// Outbound lines buffered per client before it is dropped
    #[clap(long, default_value = "64")]
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub redis_url: Option<String>,
    pub session_timeout: Duration,
    pub reaper_interval: Duration,
    pub admin_user: String,
    pub admin_password: String,
    pub topic_capacity: usize,
    pub max_clients: usize,
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
            redis_url: None,
            session_timeout: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(30),
            admin_user: "admin".to_string(),
            admin_password: "admin".to_string(),
            topic_capacity: DEFAULT_TOPIC_CAPACITY,
            max_clients: 1024,
            outbound_buffer: 64,
        }
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            address: format!("{}:{}", args.host, args.port),
            redis_url: args.redis_url.filter(|url| !url.trim().is_empty()),
            session_timeout: Duration::from_secs(args.session_timeout.max(1)),
            reaper_interval: Duration::from_secs(args.reaper_interval.max(1)),
            admin_user: args.admin_user,
            admin_password: args.admin_password,
            topic_capacity: args.topic_capacity.max(1),
            max_clients: args.max_clients,
            outbound_buffer: args.outbound_buffer.max(1),
        }
    }
}
