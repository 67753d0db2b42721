//! Provider configuration.
//!
//! Settings arrive from the host either as a typed builder or as the raw
//! name/value bag the web host hands a provider. Key spellings in the bag
//! (including the historical `xLockTtlSeconds`) are preserved for
//! compatibility with existing deployments.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;

use crate::traits::{SessionStoreError, StoreResult};

/// Default lock record TTL.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Container-level default TTL, a safety net only; per-document `ttl` always
/// overrides it.
pub const DEFAULT_CONTAINER_TTL: Duration = Duration::from_secs(300);

/// Name of the single container holding both record kinds.
pub const CONTAINER_ID: &str = "SessionStore";

/// Consistency level requested on store reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyLevel {
    #[default]
    Strong,
    BoundedStaleness,
    Session,
    Eventual,
    ConsistentPrefix,
}

impl ConsistencyLevel {
    /// Wire value for the `x-ms-consistency-level` request header.
    pub fn header_value(&self) -> &'static str {
        match self {
            ConsistencyLevel::Strong => "Strong",
            ConsistencyLevel::BoundedStaleness => "BoundedStaleness",
            ConsistencyLevel::Session => "Session",
            ConsistencyLevel::Eventual => "Eventual",
            ConsistencyLevel::ConsistentPrefix => "ConsistentPrefix",
        }
    }
}

impl std::str::FromStr for ConsistencyLevel {
    type Err = SessionStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Strong" => Ok(ConsistencyLevel::Strong),
            "BoundedStaleness" => Ok(ConsistencyLevel::BoundedStaleness),
            "Session" => Ok(ConsistencyLevel::Session),
            "Eventual" => Ok(ConsistencyLevel::Eventual),
            "ConsistentPrefix" => Ok(ConsistencyLevel::ConsistentPrefix),
            other => Err(SessionStoreError::Configuration(format!(
                "unknown consistency level '{other}'"
            ))),
        }
    }
}

/// Configuration for one named provider instance.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Account endpoint, e.g. `https://myaccount.documents.azure.com`
    pub account_endpoint: String,
    /// Base64 master key
    pub account_key: String,
    /// Logical database name
    pub database_id: String,
    /// Container name; both record kinds live here
    pub container_id: String,
    /// TTL of lock records
    pub lock_ttl: Duration,
    /// Gzip payloads on write
    pub compression_enabled: bool,
    /// Consistency level for content reads
    pub consistency_level: ConsistencyLevel,
}

impl ProviderConfig {
    /// Build a configuration from a connection string of the
    /// `AccountEndpoint=...;AccountKey=...;` form and a database name.
    /// Fails fast on anything malformed; configuration errors are never
    /// recovered at runtime.
    pub fn from_connection_string(connection_string: &str, database_id: &str) -> StoreResult<Self> {
        let mut endpoint = None;
        let mut key = None;

        for part in connection_string.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, value) = part.split_once('=').ok_or_else(|| {
                SessionStoreError::Configuration(format!(
                    "connection string segment '{part}' is not name=value"
                ))
            })?;
            match name {
                "AccountEndpoint" => endpoint = Some(value.to_string()),
                // The key itself is base64 and may contain '='; split_once
                // keeps the remainder intact.
                "AccountKey" => key = Some(value.to_string()),
                _ => {}
            }
        }

        let account_endpoint = endpoint.ok_or_else(|| {
            SessionStoreError::Configuration("connection string has no AccountEndpoint".into())
        })?;
        let account_key = key.ok_or_else(|| {
            SessionStoreError::Configuration("connection string has no AccountKey".into())
        })?;

        let config = Self {
            account_endpoint,
            account_key,
            database_id: database_id.to_string(),
            container_id: CONTAINER_ID.to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
            compression_enabled: true,
            consistency_level: ConsistencyLevel::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from the provider's raw settings bag.
    ///
    /// Recognized keys: `connectionString` (required), `databaseId`
    /// (required), `xLockTtlSeconds`, `compressionEnabled`,
    /// `consistencyLevel`.
    pub fn from_settings(settings: &HashMap<String, String>) -> StoreResult<Self> {
        let connection_string = settings.get("connectionString").ok_or_else(|| {
            SessionStoreError::Configuration("missing required setting 'connectionString'".into())
        })?;
        let database_id = settings.get("databaseId").ok_or_else(|| {
            SessionStoreError::Configuration("missing required setting 'databaseId'".into())
        })?;

        let mut config = Self::from_connection_string(connection_string, database_id)?;

        if let Some(raw) = settings.get("xLockTtlSeconds") {
            let secs: u64 = raw.parse().map_err(|_| {
                SessionStoreError::Configuration(format!("xLockTtlSeconds '{raw}' is not an integer"))
            })?;
            config.lock_ttl = Duration::from_secs(secs);
        }
        if let Some(raw) = settings.get("compressionEnabled") {
            config.compression_enabled = raw.parse().map_err(|_| {
                SessionStoreError::Configuration(format!("compressionEnabled '{raw}' is not a boolean"))
            })?;
        }
        if let Some(raw) = settings.get("consistencyLevel") {
            config.consistency_level = raw.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Override the lock record TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Toggle payload compression.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    /// Override the read consistency level.
    pub fn with_consistency_level(mut self, level: ConsistencyLevel) -> Self {
        self.consistency_level = level;
        self
    }

    /// Per-request timeout for the store client. Half the lock TTL, so a
    /// hung request cannot outlive the lock it is protecting.
    pub fn request_timeout(&self) -> Duration {
        self.lock_ttl / 2
    }

    /// Upper bound on cumulative rate-limit back-off per operation.
    pub fn max_retry_wait_on_rate_limited(&self) -> Duration {
        self.lock_ttl / 2
    }

    /// Lock TTL in whole seconds, as written into lock records.
    pub fn lock_ttl_secs(&self) -> i64 {
        self.lock_ttl.as_secs() as i64
    }

    fn validate(&self) -> StoreResult<()> {
        if !self.account_endpoint.starts_with("https://")
            && !self.account_endpoint.starts_with("http://")
        {
            return Err(SessionStoreError::Configuration(format!(
                "account endpoint '{}' must be an http(s) URL",
                self.account_endpoint
            )));
        }
        if base64::engine::general_purpose::STANDARD
            .decode(self.account_key.as_bytes())
            .is_err()
        {
            return Err(SessionStoreError::Configuration(
                "account key is not valid base64".into(),
            ));
        }
        if self.database_id.is_empty() {
            return Err(SessionStoreError::Configuration(
                "database id must not be empty".into(),
            ));
        }
        if self.lock_ttl < Duration::from_secs(2) {
            return Err(SessionStoreError::Configuration(
                "lock TTL must be at least 2 seconds".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "dGhpcyBpcyBhIHRlc3Qga2V5IGZvciBjb3Ntb3M="; // base64

    fn conn() -> String {
        format!("AccountEndpoint=https://unit.documents.azure.com:443/;AccountKey={KEY};")
    }

    #[test]
    fn parses_connection_string() {
        let config = ProviderConfig::from_connection_string(&conn(), "sessions").unwrap();
        assert_eq!(
            config.account_endpoint,
            "https://unit.documents.azure.com:443/"
        );
        assert_eq!(config.account_key, KEY);
        assert_eq!(config.database_id, "sessions");
        assert_eq!(config.container_id, "SessionStore");
        assert_eq!(config.lock_ttl, DEFAULT_LOCK_TTL);
        assert!(config.compression_enabled);
        assert_eq!(config.consistency_level, ConsistencyLevel::Strong);
    }

    #[test]
    fn rejects_missing_key() {
        let err = ProviderConfig::from_connection_string(
            "AccountEndpoint=https://unit.documents.azure.com/;",
            "sessions",
        )
        .unwrap_err();
        assert!(matches!(err, SessionStoreError::Configuration(_)));
    }

    #[test]
    fn rejects_bad_endpoint_scheme() {
        let err = ProviderConfig::from_connection_string(
            &format!("AccountEndpoint=ftp://x;AccountKey={KEY};"),
            "sessions",
        )
        .unwrap_err();
        assert!(matches!(err, SessionStoreError::Configuration(_)));
    }

    #[test]
    fn settings_bag_honors_historical_lock_ttl_key() {
        let mut settings = HashMap::new();
        settings.insert("connectionString".to_string(), conn());
        settings.insert("databaseId".to_string(), "sessions".to_string());
        settings.insert("xLockTtlSeconds".to_string(), "45".to_string());
        settings.insert("compressionEnabled".to_string(), "false".to_string());
        settings.insert("consistencyLevel".to_string(), "Eventual".to_string());

        let config = ProviderConfig::from_settings(&settings).unwrap();
        assert_eq!(config.lock_ttl, Duration::from_secs(45));
        assert!(!config.compression_enabled);
        assert_eq!(config.consistency_level, ConsistencyLevel::Eventual);
        assert_eq!(config.request_timeout(), Duration::from_millis(22_500));
        assert_eq!(
            config.max_retry_wait_on_rate_limited(),
            Duration::from_millis(22_500)
        );
    }

    #[test]
    fn unknown_consistency_level_fails_fast() {
        let mut settings = HashMap::new();
        settings.insert("connectionString".to_string(), conn());
        settings.insert("databaseId".to_string(), "sessions".to_string());
        settings.insert("consistencyLevel".to_string(), "Total".to_string());
        assert!(ProviderConfig::from_settings(&settings).is_err());
    }
}
