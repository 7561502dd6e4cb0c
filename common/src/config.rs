use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROVISIONED_MARKER: &str = "done";
pub const DEFAULT_ORG: &str = "iotlab";
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 10_000;
pub const DEVICE_TAG: &str = "esp32";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("device has not been provisioned")]
    NotProvisioned,
    #[error("required field `{0}` is empty")]
    MissingField(&'static str),
    #[error("database url `{0}` must start with http:// or https://")]
    InvalidUrl(String),
}

/// Configuration document as persisted in non-volatile storage.
///
/// Every field tolerates absence so that half-written documents still load;
/// completeness is checked by [`StoredConfig::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub wifi_password: String,
    #[serde(default)]
    pub meta: DatabaseMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMeta {
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub database_token: String,
    #[serde(default)]
    pub database_bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_interval_ms: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub token: String,
    pub bucket: String,
    pub org: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
    pub report_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootPlan {
    Provision(ConfigError),
    Run(DeviceConfig),
}

impl StoredConfig {
    pub fn is_provisioned(&self) -> bool {
        self.config.as_deref() == Some(PROVISIONED_MARKER)
    }

    pub fn mark_provisioned(&mut self) {
        self.config = Some(PROVISIONED_MARKER.to_string());
    }

    /// Fills blank Wi-Fi credentials from build-time values, leaving stored ones alone.
    pub fn seed_wifi_defaults(&mut self, ssid: Option<&str>, password: Option<&str>) {
        if self.ssid.trim().is_empty() {
            if let Some(ssid) = ssid {
                self.ssid = ssid.to_string();
            }
        }

        if self.wifi_password.is_empty() {
            if let Some(password) = password {
                self.wifi_password = password.to_string();
            }
        }
    }

    pub fn resolve(&self) -> Result<DeviceConfig, ConfigError> {
        if !self.is_provisioned() {
            return Err(ConfigError::NotProvisioned);
        }

        let ssid = required(&self.ssid, "ssid")?;
        let url = required(&self.meta.database_url, "database_url")?;
        let token = required(&self.meta.database_token, "database_token")?;
        let bucket = required(&self.meta.database_bucket, "database_bucket")?;

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(url.to_string()));
        }

        let org = self
            .meta
            .database_org
            .as_deref()
            .map(str::trim)
            .filter(|org| !org.is_empty())
            .unwrap_or(DEFAULT_ORG);

        Ok(DeviceConfig {
            network: NetworkConfig {
                ssid: ssid.to_string(),
                password: self.wifi_password.clone(),
            },
            database: DatabaseConfig {
                url: url.trim_end_matches('/').to_string(),
                token: token.to_string(),
                bucket: bucket.to_string(),
                org: org.to_string(),
            },
            report_interval_ms: parse_report_interval(self.meta.report_interval_ms.as_deref()),
        })
    }
}

impl BootPlan {
    pub fn from_stored(stored: &StoredConfig) -> Self {
        match stored.resolve() {
            Ok(config) => Self::Run(config),
            Err(err) => Self::Provision(err),
        }
    }
}

/// Interval as entered in the portal; anything unusable falls back to the default.
pub fn parse_report_interval(raw: Option<&str>) -> u64 {
    raw.map(str::trim)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_REPORT_INTERVAL_MS)
}

fn required<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        Err(ConfigError::MissingField(field))
    } else {
        Ok(value)
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ssid=`{}` url={} bucket={} org={} token={} interval={}ms",
            self.network.ssid,
            self.database.url,
            self.database.bucket,
            self.database.org,
            if self.database.token.is_empty() {
                "<unset>"
            } else {
                "<set>"
            },
            self.report_interval_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn complete() -> StoredConfig {
        StoredConfig {
            config: Some("done".to_string()),
            ssid: "lab".to_string(),
            wifi_password: "secret".to_string(),
            meta: DatabaseMeta {
                database_url: "http://10.0.0.5:8086/".to_string(),
                database_token: "tok".to_string(),
                database_bucket: "sensors".to_string(),
                database_org: None,
                report_interval_ms: Some("5000".to_string()),
            },
        }
    }

    #[test]
    fn resolves_complete_document() {
        let config = complete().resolve().unwrap();

        assert_eq!(
            config,
            DeviceConfig {
                network: NetworkConfig {
                    ssid: "lab".to_string(),
                    password: "secret".to_string(),
                },
                database: DatabaseConfig {
                    url: "http://10.0.0.5:8086".to_string(),
                    token: "tok".to_string(),
                    bucket: "sensors".to_string(),
                    org: DEFAULT_ORG.to_string(),
                },
                report_interval_ms: 5_000,
            }
        );
    }

    #[test]
    fn missing_marker_plans_provisioning() {
        let mut stored = complete();
        stored.config = None;
        assert_eq!(
            BootPlan::from_stored(&stored),
            BootPlan::Provision(ConfigError::NotProvisioned)
        );

        stored.config = Some("pending".to_string());
        assert_eq!(
            BootPlan::from_stored(&stored),
            BootPlan::Provision(ConfigError::NotProvisioned)
        );

        assert_eq!(
            BootPlan::from_stored(&StoredConfig::default()),
            BootPlan::Provision(ConfigError::NotProvisioned)
        );
    }

    #[test]
    fn incomplete_document_plans_provisioning() {
        let mut stored = complete();
        stored.meta.database_token = "  ".to_string();

        assert_eq!(
            BootPlan::from_stored(&stored),
            BootPlan::Provision(ConfigError::MissingField("database_token"))
        );
    }

    #[test]
    fn rejects_url_without_scheme() {
        let mut stored = complete();
        stored.meta.database_url = "10.0.0.5:8086".to_string();

        assert_eq!(
            stored.resolve(),
            Err(ConfigError::InvalidUrl("10.0.0.5:8086".to_string()))
        );
    }

    #[test]
    fn report_interval_falls_back_to_default() {
        assert_eq!(parse_report_interval(None), DEFAULT_REPORT_INTERVAL_MS);
        assert_eq!(parse_report_interval(Some("")), DEFAULT_REPORT_INTERVAL_MS);
        assert_eq!(parse_report_interval(Some("abc")), DEFAULT_REPORT_INTERVAL_MS);
        assert_eq!(parse_report_interval(Some("0")), DEFAULT_REPORT_INTERVAL_MS);
        assert_eq!(parse_report_interval(Some(" 60000 ")), 60_000);
    }

    #[test]
    fn explicit_org_overrides_default() {
        let mut stored = complete();
        stored.meta.database_org = Some("home".to_string());

        assert_eq!(stored.resolve().unwrap().database.org, "home");
    }

    #[test]
    fn reads_persisted_json_layout() {
        let raw = r#"{
            "config": "done",
            "ssid": "lab",
            "wifi_password": "secret",
            "meta": {
                "database_url": "https://influx.example.com",
                "database_token": "tok",
                "database_bucket": "sensors",
                "report_interval_ms": "30000"
            }
        }"#;

        let stored: StoredConfig = serde_json::from_str(raw).unwrap();
        let config = stored.resolve().unwrap();

        assert_eq!(config.database.url, "https://influx.example.com");
        assert_eq!(config.report_interval_ms, 30_000);
    }

    #[test]
    fn seeding_keeps_stored_credentials() {
        let mut stored = StoredConfig::default();
        stored.seed_wifi_defaults(Some("build-ssid"), Some("build-pass"));
        assert_eq!(stored.ssid, "build-ssid");
        assert_eq!(stored.wifi_password, "build-pass");

        let mut stored = complete();
        stored.seed_wifi_defaults(Some("build-ssid"), Some("build-pass"));
        assert_eq!(stored.ssid, "lab");
        assert_eq!(stored.wifi_password, "secret");
    }

    #[test]
    fn display_hides_token() {
        let mut stored = complete();
        stored.meta.database_token = "Zq81-private".to_string();
        let rendered = stored.resolve().unwrap().to_string();

        assert!(rendered.contains("token=<set>"));
        assert!(!rendered.contains("Zq81-private"));
    }
}
