//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base data directory
    pub huddle_dir: PathBuf,
    /// Database path
    pub database_path: PathBuf,
    /// Service token file path
    pub service_token_file: PathBuf,
    /// TCP address the API listens on
    pub bind_addr: SocketAddr,
    /// Poll cadence of a live stream
    pub poll_interval: Duration,
    /// Maximum lifetime of one stream connection
    pub max_stream_duration: Duration,
    /// Messages folded into a single merge, newest first
    pub message_window: u32,
    /// Manual entries handed to the merge engine
    pub entry_window: u32,
    /// Model used for merge applications
    pub groq_model: String,
    /// API key for the generation endpoint
    pub groq_api_key: Option<String>,
    /// Override for the generation endpoint base URL
    pub groq_base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let huddle_dir = home.join(".huddle");

        Self {
            database_path: huddle_dir.join("sqlite.db"),
            service_token_file: huddle_dir.join("service-token"),
            huddle_dir,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4460)),
            poll_interval: Duration::from_secs(8),
            max_stream_duration: Duration::from_secs(300),
            message_window: 20,
            entry_window: 10,
            groq_model: "llama-3.1-8b-instant".to_string(),
            groq_api_key: None,
            groq_base_url: None,
        }
    }
}

impl Config {
    /// Load configuration from environment or defaults
    ///
    /// Directory structure:
    /// ```text
    /// ~/.huddle/
    /// ├── sqlite.db         # Database
    /// └── service-token     # Service token for frontend → huddle-server
    /// ```
    pub fn load() -> anyhow::Result<Self> {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        // Use HUDDLE_DIR env var if set, otherwise ~/.huddle
        let huddle_dir = std::env::var("HUDDLE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".huddle"));

        std::fs::create_dir_all(&huddle_dir)?;

        let defaults = Config::default();

        let bind_addr = match std::env::var("HUDDLE_BIND") {
            Ok(addr) => addr.parse()?,
            Err(_) => defaults.bind_addr,
        };

        Ok(Self {
            database_path: huddle_dir.join("sqlite.db"),
            service_token_file: huddle_dir.join("service-token"),
            huddle_dir,
            bind_addr,
            poll_interval: env_secs("HUDDLE_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            max_stream_duration: env_secs("HUDDLE_MAX_STREAM_SECS", defaults.max_stream_duration)?,
            message_window: defaults.message_window,
            entry_window: defaults.entry_window,
            groq_model: std::env::var("GROQ_MODEL").unwrap_or(defaults.groq_model),
            groq_api_key: std::env::var("GROQ_API_KEY").ok(),
            groq_base_url: std::env::var("GROQ_BASE_URL").ok(),
        })
    }
}

fn env_secs(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(value) => Ok(Duration::from_secs(value.parse()?)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.database_path.ends_with("sqlite.db"));
        assert!(config.service_token_file.ends_with("service-token"));
        assert_eq!(config.poll_interval, Duration::from_secs(8));
        assert_eq!(config.max_stream_duration, Duration::from_secs(300));
        assert_eq!(config.message_window, 20);
        assert_eq!(config.entry_window, 10);
    }

    #[test]
    fn test_default_config_directory_structure() {
        let config = Config::default();

        let home = dirs::home_dir().unwrap();
        let huddle_dir = home.join(".huddle");

        assert!(config.database_path.starts_with(&huddle_dir));
        assert!(config.service_token_file.starts_with(&huddle_dir));
    }

    #[test]
    fn test_config_load_with_custom_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let custom_path = temp_dir.path().to_path_buf();

        // Save current value to restore later
        let old_val = env::var("HUDDLE_DIR").ok();
        // SAFETY: This test runs in isolation and we restore the env var afterward
        unsafe { env::set_var("HUDDLE_DIR", &custom_path) };

        let config = Config::load().unwrap();

        // Should use custom directory, and create it
        assert!(config.database_path.starts_with(&custom_path));
        assert!(config.service_token_file.starts_with(&custom_path));
        assert!(custom_path.exists());

        // Cleanup
        // SAFETY: Restoring environment to previous state
        unsafe {
            if let Some(val) = old_val {
                env::set_var("HUDDLE_DIR", val);
            } else {
                env::remove_var("HUDDLE_DIR");
            }
        }
    }

    #[test]
    fn test_config_paths_are_absolute() {
        let config = Config::default();

        if dirs::home_dir().is_some() {
            assert!(config.huddle_dir.is_absolute());
            assert!(config.database_path.is_absolute());
            assert!(config.service_token_file.is_absolute());
        }
    }

    #[test]
    fn test_config_clone() {
        let config1 = Config::default();
        let config2 = config1.clone();

        assert_eq!(config1.huddle_dir, config2.huddle_dir);
        assert_eq!(config1.bind_addr, config2.bind_addr);
        assert_eq!(config1.groq_model, config2.groq_model);
    }
}
