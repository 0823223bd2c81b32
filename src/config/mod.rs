//! Process configuration, read from the environment once at startup.
//!
//! Only `DATABASE_URL` is required; it is held as a `SecretString`.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Identifier of this deployment, stamped on every produced event.
    pub cluster_name_id: String,
    pub external_dns: String,
    pub listen_addr: String,
    pub notification_service_url: String,
    pub tools_service_url: String,
    pub slack_api_url: String,
    pub user_directory_url: Option<String>,
    pub archive_log_path: Option<String>,
    pub transport_partitions: u32,
    pub transport_retention: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Read every variable, applying defaults. The binary loads `.env` first.
    pub fn from_env() -> Result<Self> {
        let transport_partitions = parsed_var("TRANSPORT_PARTITIONS", 8u32)?;
        if transport_partitions == 0 {
            return Err(Error::Config(
                "TRANSPORT_PARTITIONS must be at least 1".to_string(),
            ));
        }
        let retention_hours = parsed_var("TRANSPORT_RETENTION_HOURS", 168u64)?;
        let retention_secs = retention_hours.checked_mul(3600).ok_or_else(|| {
            Error::Config(format!(
                "TRANSPORT_RETENTION_HOURS is out of range: {retention_hours}"
            ))
        })?;

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            cluster_name_id: optional_var("AX_CLUSTER_NAME_ID")
                .unwrap_or_else(|| "unknown".to_string()),
            external_dns: optional_var("AXOPS_EXT_DNS").unwrap_or_default(),
            listen_addr: optional_var("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            notification_service_url: optional_var("NOTIFICATION_SERVICE_URL")
                .unwrap_or_else(|| "http://axnotification:9889".to_string()),
            tools_service_url: optional_var("TOOLS_SERVICE_URL")
                .unwrap_or_else(|| "http://axops-internal:8085/v1".to_string()),
            slack_api_url: optional_var("SLACK_API_URL")
                .unwrap_or_else(|| "https://slack.com/api".to_string()),
            user_directory_url: optional_var("USER_DIRECTORY_URL"),
            archive_log_path: optional_var("ARCHIVE_LOG_PATH"),
            transport_partitions,
            transport_retention: Duration::from_secs(retention_secs),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Values for the `%%NAME%%` placeholders allowed inside event detail.
    pub fn substitutions(&self) -> Vec<(String, String)> {
        vec![
            (
                "%%AX_CLUSTER_NAME_ID%%".to_string(),
                self.cluster_name_id.clone(),
            ),
            ("%%AXOPS_EXT_DNS%%".to_string(), self.external_dns.clone()),
        ]
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match optional_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("environment variable {name} is not valid: {raw}"))),
        None => Ok(default),
    }
}
