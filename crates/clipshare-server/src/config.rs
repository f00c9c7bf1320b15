use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use clipshare_crypto::KEY_LEN;
use clipshare_crypto::keys::key_from_base64;
use clipshare_store::DEFAULT_ROOM_TTL_DAYS;

/// Process-wide settings, read once at startup and passed down explicitly.
pub struct Config {
    pub encryption_key: [u8; KEY_LEN],
    pub hash_salt: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub room_ttl_days: i64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("db_path", &self.db_path)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("room_ttl_days", &self.room_ttl_days)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Required: `CLIPSHARE_ENCRYPTION_KEY` (base64, 32 bytes) and
    /// `CLIPSHARE_HASH_SALT`. Everything else has a default.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let Some(encoded_key) = lookup(&vars, "CLIPSHARE_ENCRYPTION_KEY") else {
            bail!("CLIPSHARE_ENCRYPTION_KEY is not set");
        };
        let encryption_key =
            key_from_base64(encoded_key).context("CLIPSHARE_ENCRYPTION_KEY is not a valid key")?;

        let Some(hash_salt) = lookup(&vars, "CLIPSHARE_HASH_SALT") else {
            bail!("CLIPSHARE_HASH_SALT is not set");
        };

        let port: u16 = lookup(&vars, "CLIPSHARE_PORT")
            .unwrap_or("5134")
            .parse()
            .context("CLIPSHARE_PORT is not a valid port")?;

        let room_ttl_days: i64 = match lookup(&vars, "CLIPSHARE_ROOM_TTL_DAYS") {
            Some(v) => v.parse().context("CLIPSHARE_ROOM_TTL_DAYS is not a number")?,
            None => DEFAULT_ROOM_TTL_DAYS,
        };
        if room_ttl_days <= 0 {
            bail!("CLIPSHARE_ROOM_TTL_DAYS must be positive");
        }

        Ok(Self {
            encryption_key,
            hash_salt: hash_salt.to_string(),
            db_path: lookup(&vars, "CLIPSHARE_DB_PATH").unwrap_or("clipshare.db").into(),
            host: lookup(&vars, "CLIPSHARE_HOST").unwrap_or("0.0.0.0").to_string(),
            port,
            room_ttl_days,
        })
    }
}

/// Unset and blank variables are treated the same.
fn lookup<'a>(vars: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipshare_crypto::keys::{generate_key, key_to_base64};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_fill_optional_values() {
        let key = generate_key();
        let config = Config::from_vars(vars(&[
            ("CLIPSHARE_ENCRYPTION_KEY", &key_to_base64(&key)),
            ("CLIPSHARE_HASH_SALT", "pepper"),
        ]))
        .unwrap();

        assert_eq!(config.encryption_key, key);
        assert_eq!(config.hash_salt, "pepper");
        assert_eq!(config.port, 5134);
        assert_eq!(config.room_ttl_days, 7);
        assert_eq!(config.db_path, PathBuf::from("clipshare.db"));
    }

    #[test]
    fn missing_key_is_fatal() {
        let err = Config::from_vars(vars(&[("CLIPSHARE_HASH_SALT", "pepper")])).unwrap_err();
        assert!(err.to_string().contains("CLIPSHARE_ENCRYPTION_KEY"));
    }

    #[test]
    fn missing_salt_is_fatal() {
        let key = key_to_base64(&generate_key());
        let err = Config::from_vars(vars(&[
            ("CLIPSHARE_ENCRYPTION_KEY", &key),
            ("CLIPSHARE_HASH_SALT", "   "),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("CLIPSHARE_HASH_SALT"));
    }

    #[test]
    fn short_key_is_fatal() {
        let err = Config::from_vars(vars(&[
            ("CLIPSHARE_ENCRYPTION_KEY", "AAAA"),
            ("CLIPSHARE_HASH_SALT", "pepper"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("not a valid key"));
    }

    #[test]
    fn debug_hides_secrets() {
        let config = Config::from_vars(vars(&[
            ("CLIPSHARE_ENCRYPTION_KEY", &key_to_base64(&[1u8; KEY_LEN])),
            ("CLIPSHARE_HASH_SALT", "pepper"),
        ]))
        .unwrap();
        assert!(!format!("{:?}", config).contains("pepper"));
    }
}
