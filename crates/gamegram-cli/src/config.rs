use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use gamegram_sync::{ReconnectPolicy, SyncConfig};
use gamegram_types::{RoomId, UserIdentity};

/// Harness settings, read from `GAMEGRAM_*` environment variables.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub room_id: RoomId,
    pub identity: UserIdentity,
    /// Messages of fake history put in the loopback store before start.
    pub seed_messages: u32,
    pub sync: SyncConfig,
}

impl CliConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = SyncConfig::default();
        let default_policy = &defaults.reconnect;

        let identity = match lookup("GAMEGRAM_USERNAME") {
            Some(name) if !name.trim().is_empty() => UserIdentity {
                username: name.trim().to_string(),
                is_authenticated: parse_or(&lookup, "GAMEGRAM_AUTHENTICATED", false)?,
                country: lookup("GAMEGRAM_COUNTRY"),
            },
            _ => UserIdentity::guest(),
        };

        let reconnect = ReconnectPolicy::new(
            millis_or(&lookup, "GAMEGRAM_RECONNECT_BASE_MS", default_policy.base_delay())?,
            millis_or(&lookup, "GAMEGRAM_RECONNECT_MAX_MS", default_policy.max_delay())?,
            parse_or(&lookup, "GAMEGRAM_RECONNECT_MAX_ATTEMPTS", default_policy.max_attempts())?,
        );

        let sync = SyncConfig {
            page_size: parse_or(&lookup, "GAMEGRAM_PAGE_SIZE", defaults.page_size)?,
            poll_interval: millis_or(&lookup, "GAMEGRAM_POLL_INTERVAL_MS", defaults.poll_interval)?,
            health_check_interval: millis_or(
                &lookup,
                "GAMEGRAM_HEALTH_CHECK_INTERVAL_MS",
                defaults.health_check_interval,
            )?,
            handshake_timeout: millis_or(
                &lookup,
                "GAMEGRAM_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout,
            )?,
            reconnect,
            ..defaults
        };

        Ok(Self {
            room_id: parse_or(&lookup, "GAMEGRAM_ROOM_ID", 1)?,
            identity,
            seed_messages: parse_or(&lookup, "GAMEGRAM_SEED_MESSAGES", 120)?,
            sync,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        None => Ok(default),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> anyhow::Result<Duration> {
    let ms = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<CliConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CliConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn falls_back_to_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.room_id, 1);
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.sync.poll_interval, Duration::from_secs(1));
        assert_eq!(config.sync.reconnect.max_delay(), Duration::from_millis(3000));
        assert!(config.identity.username.starts_with("@user"));
    }

    #[test]
    fn reads_overrides() {
        let config = config(&[
            ("GAMEGRAM_ROOM_ID", "7"),
            ("GAMEGRAM_USERNAME", " @ana "),
            ("GAMEGRAM_AUTHENTICATED", "true"),
            ("GAMEGRAM_PAGE_SIZE", "20"),
            ("GAMEGRAM_RECONNECT_BASE_MS", "100"),
        ])
        .unwrap();
        assert_eq!(config.room_id, 7);
        assert_eq!(config.identity.username, "@ana");
        assert!(config.identity.is_authenticated);
        assert_eq!(config.sync.page_size, 20);
        assert_eq!(config.sync.reconnect.base_delay(), Duration::from_millis(100));
    }

    #[test]
    fn rejects_unparseable_values() {
        let err = config(&[("GAMEGRAM_POLL_INTERVAL_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("GAMEGRAM_POLL_INTERVAL_MS"));
    }
}
