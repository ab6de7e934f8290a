use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide configuration, parsed once at startup.
#[derive(Debug, Clone, Parser)]
#[command(name = "server")]
#[command(about = "Cloud storage backend with per-user files and search", long_about = None)]
pub struct Config {
    #[arg(long, env = "CLOUDVAULT_BIND", default_value = "0.0.0.0:3000", help = "Address to listen on")]
    pub bind: SocketAddr,

    #[arg(long, env = "CLOUDVAULT_DATABASE", default_value = "cloud_storage.db", help = "SQLite catalog path")]
    pub database: PathBuf,

    #[arg(long, env = "CLOUDVAULT_STORAGE_ROOT", default_value = "uploads/users", help = "Root directory for uploaded blobs")]
    pub storage_root: PathBuf,

    #[arg(long, env = "CLOUDVAULT_JWT_SECRET", hide_env_values = true, help = "Secret used to sign session tokens")]
    pub jwt_secret: String,

    #[arg(long, env = "CLOUDVAULT_TOKEN_TTL_SECS", default_value_t = 3600, help = "Session token lifetime in seconds")]
    pub token_ttl_secs: u64,

    #[arg(long, env = "CLOUDVAULT_RECOMMENDER_URL", default_value = "http://localhost:5000/recommend", help = "Recommendation service endpoint")]
    pub recommender_url: String,

    #[arg(long, env = "CLOUDVAULT_RECOMMENDER_TIMEOUT_SECS", default_value_t = 10, help = "Recommendation call timeout in seconds")]
    pub recommender_timeout_secs: u64,

    #[arg(long, env = "CLOUDVAULT_BCRYPT_COST", default_value_t = bcrypt::DEFAULT_COST, help = "bcrypt cost factor (4-31)")]
    pub bcrypt_cost: u32,

    #[arg(long, env = "CLOUDVAULT_MAX_UPLOAD_BYTES", default_value_t = 50 * 1024 * 1024, help = "Maximum request body size in bytes")]
    pub max_upload_bytes: usize,
}

impl Config {
    /// Rejects settings the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jwt_secret.trim().is_empty() {
            anyhow::bail!("JWT secret must not be empty");
        }
        if !(4..=31).contains(&self.bcrypt_cost) {
            anyhow::bail!("bcrypt cost must be between 4 and 31, got {}", self.bcrypt_cost);
        }
        if self.token_ttl_secs == 0 {
            anyhow::bail!("token TTL must be positive");
        }
        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn recommender_timeout(&self) -> Duration {
        Duration::from_secs(self.recommender_timeout_secs)
    }
}
