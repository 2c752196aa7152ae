use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use tracing::warn;

const DEFAULT_DATABASE_URL: &str = "postgres://agencyhub:agencyhub@db:5432/agencyhub";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub jwt_secret: String,
    pub bind_addr: SocketAddr,
    pub upload_dir: PathBuf,
    pub public_files_url: String,
    pub max_upload_bytes: usize,
    pub integration_sync_delay: Duration,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Self {
            database_url: string("DATABASE_URL", DEFAULT_DATABASE_URL),
            database_max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS", 5),
            jwt_secret: string("JWT_SECRET", "change-me"),
            bind_addr: parsed(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
            upload_dir: PathBuf::from(string("UPLOAD_DIR", "./uploads")),
            public_files_url: string("PUBLIC_FILES_URL", "/files")
                .trim_end_matches('/')
                .to_string(),
            max_upload_bytes: parsed(&lookup, "MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
            integration_sync_delay: Duration::from_millis(parsed(
                &lookup,
                "INTEGRATION_SYNC_DELAY_MS",
                3000,
            )),
            gemini_api_key: lookup("GEMINI_API_KEY").filter(|key| !key.trim().is_empty()),
            gemini_model: string("GEMINI_MODEL", DEFAULT_GEMINI_MODEL),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_with(&[]);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.integration_sync_delay, Duration::from_secs(3));
        assert_eq!(config.max_upload_bytes, 10 * 1024 * 1024);
        assert!(config.gemini_api_key.is_none());
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults() {
        let config = config_with(&[
            ("INTEGRATION_SYNC_DELAY_MS", "soon"),
            ("DATABASE_MAX_CONNECTIONS", "12"),
            ("GEMINI_API_KEY", "  "),
            ("PUBLIC_FILES_URL", "https://cdn.example.com/files/"),
        ]);
        assert_eq!(config.integration_sync_delay, Duration::from_secs(3));
        assert_eq!(config.database_max_connections, 12);
        assert!(config.gemini_api_key.is_none());
        assert_eq!(config.public_files_url, "https://cdn.example.com/files");
    }
}
