use anyhow::Result;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LESENSE_API_BASE: &str = "https://lesense.logicae.com.br/api/1.0";
const DEFAULT_TAGO_API_BASE: &str = "https://api.tago.io";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 15_000;

const DEVICE_TOKEN_KEYS: &[&str] = &["LESENSE_SYNC_DEVICE_TOKEN", "DEVICE_TOKEN", "device_token"];
const LESENSE_TOKEN_KEYS: &[&str] = &[
    "LESENSE_SYNC_LESENSE_TOKEN",
    "LESENSE_TOKEN",
    "lesense_token",
];

fn setup_config_path() -> Option<PathBuf> {
    env_value(&["LESENSE_SYNC_SETUP_CONFIG_PATH"]).map(PathBuf::from)
}

/// First non-blank value among `keys`, trimmed.
fn env_value(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        env::var(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SetupConfigOverrides {
    #[serde(default)]
    device_token: Option<String>,
    #[serde(default)]
    lesense_token: Option<String>,
    #[serde(default)]
    lesense_api_base: Option<String>,
    #[serde(default)]
    tago_api_base: Option<String>,
    #[serde(default)]
    http_timeout_ms: Option<u64>,
}

pub(crate) fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "lesense-sync failed to read setup config; using env values"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "lesense-sync failed to parse setup config; using env values"
            );
            None
        }
    }
}

/// Fills every field the environment left unset. Environment values always win.
fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides, env: &EnvSnapshot) {
    if env.device_token.is_none() {
        if let Some(token) = non_blank(overrides.device_token.as_deref()) {
            config.device_token = Some(token);
        }
    }
    if env.lesense_token.is_none() {
        if let Some(token) = non_blank(overrides.lesense_token.as_deref()) {
            config.lesense_token = Some(token);
        }
    }
    if env.lesense_api_base.is_none() {
        if let Some(base) = non_blank(overrides.lesense_api_base.as_deref()) {
            config.lesense_api_base = base;
        }
    }
    if env.tago_api_base.is_none() {
        if let Some(base) = non_blank(overrides.tago_api_base.as_deref()) {
            config.tago_api_base = base;
        }
    }
    if env.http_timeout_ms.is_none() {
        if let Some(value) = overrides.http_timeout_ms.filter(|v| *v != 0) {
            config.http_timeout_ms = value;
        }
    }
}

#[derive(Debug, Clone, Default)]
struct EnvSnapshot {
    device_token: Option<String>,
    lesense_token: Option<String>,
    lesense_api_base: Option<String>,
    tago_api_base: Option<String>,
    http_timeout_ms: Option<u64>,
    otlp_endpoint: Option<String>,
}

impl EnvSnapshot {
    fn capture() -> Self {
        Self {
            device_token: env_value(DEVICE_TOKEN_KEYS),
            lesense_token: env_value(LESENSE_TOKEN_KEYS),
            lesense_api_base: env_value(&["LESENSE_API_BASE"]),
            tago_api_base: env_value(&["TAGO_API_BASE"]),
            http_timeout_ms: env_value(&["LESENSE_SYNC_HTTP_TIMEOUT_MS"])
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v != 0),
            otlp_endpoint: env_value(&["OTEL_EXPORTER_OTLP_ENDPOINT"]),
        }
    }

    fn into_config(self) -> Config {
        Config {
            device_token: self.device_token,
            lesense_token: self.lesense_token,
            lesense_api_base: self
                .lesense_api_base
                .unwrap_or_else(|| DEFAULT_LESENSE_API_BASE.to_string()),
            tago_api_base: self
                .tago_api_base
                .unwrap_or_else(|| DEFAULT_TAGO_API_BASE.to_string()),
            http_timeout_ms: self.http_timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS),
            otlp_endpoint: self.otlp_endpoint,
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub device_token: Option<String>,
    pub lesense_token: Option<String>,
    pub lesense_api_base: String,
    pub tago_api_base: String,
    pub http_timeout_ms: u64,
    pub otlp_endpoint: Option<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("device_token", &self.device_token.as_ref().map(|_| "<redacted>"))
            .field("lesense_token", &self.lesense_token.as_ref().map(|_| "<redacted>"))
            .field("lesense_api_base", &self.lesense_api_base)
            .field("tago_api_base", &self.tago_api_base)
            .field("http_timeout_ms", &self.http_timeout_ms)
            .field("otlp_endpoint", &self.otlp_endpoint)
            .finish()
    }
}

impl Config {
    /// Missing credentials are not an error here; the sync run reports them.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let snapshot = EnvSnapshot::capture();
        let overrides = setup_config_path().and_then(|path| load_setup_config_overrides(&path));
        Ok(Self::resolve(snapshot, overrides.as_ref()))
    }

    fn resolve(snapshot: EnvSnapshot, overrides: Option<&SetupConfigOverrides>) -> Self {
        let mut config = snapshot.clone().into_config();
        if let Some(overrides) = overrides {
            apply_setup_overrides(&mut config, overrides, &snapshot);
        }
        config
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// OTLP/HTTP span export URL; a bare collector address gets `/v1/traces` appended.
    pub fn otlp_traces_endpoint(&self) -> Option<String> {
        let base = self.otlp_endpoint.as_deref()?.trim();
        if base.is_empty() {
            return None;
        }
        Some(if base.ends_with("/v1/traces") {
            base.to_string()
        } else {
            format!("{}/v1/traces", base.trim_end_matches('/'))
        })
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            device_token: self.device_token.clone(),
            lesense_token: self.lesense_token.clone(),
        }
    }
}

/// The two opaque secrets a run needs. Either may be absent until the run checks.
#[derive(Clone, Default)]
pub struct Credentials {
    pub device_token: Option<String>,
    pub lesense_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("device_token", &self.device_token.is_some())
            .field("lesense_token", &self.lesense_token.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingCredential {
    DeviceToken,
    LesenseToken,
}

impl fmt::Display for MissingCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingCredential::DeviceToken => f.write_str("device_token"),
            MissingCredential::LesenseToken => f.write_str("lesense_token"),
        }
    }
}

impl Credentials {
    /// Returns `(device_token, lesense_token)`, sink credential first.
    pub fn require(&self) -> Result<(&str, &str), MissingCredential> {
        let device_token = self
            .device_token
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(MissingCredential::DeviceToken)?;
        let lesense_token = self
            .lesense_token
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(MissingCredential::LesenseToken)?;
        Ok((device_token, lesense_token))
    }
}
