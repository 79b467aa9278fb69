//! Configuration resolution
//!
//! Every setting is resolved in three tiers, highest priority first:
//! 1. Environment variable (`HIOMI_*`)
//! 2. Optional TOML file named by `HIOMI_CONFIG`
//! 3. Built-in default
//!
//! Resolution is a function of a key lookup so it can be exercised without
//! mutating the process environment; [`ServiceConfig::from_env`] plugs in
//! `std::env::var`.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Inference backend used when nothing else is configured
pub const DEFAULT_API_URL: &str = "http://backendpneu-env.eba-9mp795ix.eu-north-1.elasticbeanstalk.com";

/// Maximum upload size: 20 MiB
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 30;
pub const DEFAULT_RESULT_EVENT: &str = "result";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

/// Optional TOML configuration file
///
/// All fields are optional; anything missing falls through to the built-in
/// default. Environment variables override values found here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    pub api_url: Option<String>,
    pub upload_url: Option<String>,
    pub result_url: Option<String>,
    pub default_user_id: Option<String>,
    pub default_model: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub poll_max_attempts: Option<u32>,
    pub result_push: Option<bool>,
    pub result_event: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub max_upload_bytes: Option<u64>,
    /// Same format as `HIOMI_ACCEPTED_TYPES`
    pub accepted_types: Option<String>,
    pub bind_addr: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load and parse a TOML configuration file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// One accepted MIME type and the file extensions that go with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedType {
    /// Exact type (`application/dicom`) or wildcard (`image/*`)
    pub mime: String,
    /// Lowercase extensions including the leading dot
    pub extensions: Vec<String>,
}

impl AcceptedType {
    pub fn new(mime: &str, extensions: &[&str]) -> Self {
        Self {
            mime: mime.to_string(),
            extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
        }
    }

    fn mime_matches(&self, mime: &str) -> bool {
        let mime = mime.trim().to_ascii_lowercase();
        match self.mime.strip_suffix("/*") {
            Some(major) => mime.split('/').next() == Some(major),
            None => mime == self.mime,
        }
    }
}

/// Client-side upload restrictions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_bytes: u64,
    pub accepted_types: Vec<AcceptedType>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            accepted_types: vec![
                AcceptedType::new("image/*", &[".jpg", ".jpeg", ".png"]),
                AcceptedType::new("application/dicom", &[".dcm"]),
            ],
        }
    }
}

impl UploadPolicy {
    /// Parse `image/*=.jpg,.jpeg,.png;application/dicom=.dcm`
    pub fn parse_accepted_types(spec: &str) -> Result<Vec<AcceptedType>> {
        let mut types = Vec::new();
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (mime, exts) = entry.split_once('=').ok_or_else(|| {
                Error::Config(format!("accepted type entry {entry:?} is missing '='"))
            })?;
            let extensions: Vec<String> = exts
                .split(',')
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .map(|e| if e.starts_with('.') { e } else { format!(".{e}") })
                .collect();
            if mime.trim().is_empty() || extensions.is_empty() {
                return Err(Error::Config(format!("accepted type entry {entry:?} is incomplete")));
            }
            types.push(AcceptedType {
                mime: mime.trim().to_ascii_lowercase(),
                extensions,
            });
        }
        if types.is_empty() {
            return Err(Error::Config("no accepted upload types configured".to_string()));
        }
        Ok(types)
    }

    /// Check a file against size, extension and MIME type restrictions
    ///
    /// The extension must belong to an accepted type. When a MIME type is
    /// known it must match that same entry.
    pub fn check(&self, filename: &str, mime: Option<&str>, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidInput(format!("{filename} is empty")));
        }
        if size > self.max_bytes {
            return Err(Error::InvalidInput(format!(
                "{filename} is {size} bytes, maximum is {} bytes",
                self.max_bytes
            )));
        }

        let extension = filename
            .rfind('.')
            .map(|i| filename[i..].to_ascii_lowercase())
            .ok_or_else(|| Error::InvalidInput(format!("{filename} has no file extension")))?;

        let entry = self
            .accepted_types
            .iter()
            .find(|t| t.extensions.contains(&extension))
            .ok_or_else(|| {
                Error::InvalidInput(format!("{extension} files are not accepted"))
            })?;

        if let Some(mime) = mime.filter(|m| !m.trim().is_empty()) {
            // Browsers report DICOM as application/octet-stream
            let generic = mime.eq_ignore_ascii_case("application/octet-stream");
            if !generic && !entry.mime_matches(mime) {
                return Err(Error::InvalidInput(format!(
                    "{filename} has type {mime}, expected {}",
                    entry.mime
                )));
            }
        }

        Ok(())
    }
}

/// Fully resolved service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Inference backend base (proxy target for `/process_image`)
    pub api_url: String,
    /// Upload service base (`{upload_url}/upload`)
    pub upload_url: String,
    /// Result service base (`/results` and `/stream`)
    pub result_url: String,
    pub default_user_id: String,
    pub default_model: String,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    /// When false the push channel is bypassed and results are polled
    pub result_push: bool,
    /// SSE event name that carries result payloads
    pub result_event: String,
    pub http_timeout: Duration,
    pub upload: UploadPolicy,
    pub bind_addr: String,
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            upload_url: DEFAULT_API_URL.to_string(),
            result_url: DEFAULT_API_URL.to_string(),
            default_user_id: "1".to_string(),
            default_model: "1".to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            poll_max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
            result_push: true,
            result_event: DEFAULT_RESULT_EVENT.to_string(),
            http_timeout: Duration::from_secs(30),
            upload: UploadPolicy::default(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Resolve from the process environment
    pub fn from_env() -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve using `lookup` for environment values
    pub fn resolve<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let toml = match env("HIOMI_CONFIG") {
            Some(path) => {
                info!("Loading configuration file {}", path);
                load_toml_config(Path::new(&path))?
            }
            None => TomlConfig::default(),
        };

        let defaults = Self::default();

        let api_url = env("HIOMI_API_URL")
            .or_else(|| env("NEXT_PUBLIC_API_URL"))
            .or(toml.api_url)
            .unwrap_or(defaults.api_url);
        let api_url = normalize_base_url("api_url", &api_url)?;

        // Upload and result services default to the inference backend
        let upload_url = env("HIOMI_UPLOAD_URL")
            .or(toml.upload_url)
            .map(|u| normalize_base_url("upload_url", &u))
            .transpose()?
            .unwrap_or_else(|| api_url.clone());
        let result_url = env("HIOMI_RESULT_URL")
            .or(toml.result_url)
            .map(|u| normalize_base_url("result_url", &u))
            .transpose()?
            .unwrap_or_else(|| api_url.clone());

        let poll_interval_ms = parse_tier(
            "HIOMI_POLL_INTERVAL_MS",
            env("HIOMI_POLL_INTERVAL_MS"),
            toml.poll_interval_ms,
            DEFAULT_POLL_INTERVAL_MS,
        )?;
        if poll_interval_ms == 0 {
            return Err(Error::Config("poll interval must be greater than zero".to_string()));
        }

        let poll_max_attempts = parse_tier(
            "HIOMI_POLL_MAX_ATTEMPTS",
            env("HIOMI_POLL_MAX_ATTEMPTS"),
            toml.poll_max_attempts,
            DEFAULT_POLL_MAX_ATTEMPTS,
        )?;
        if poll_max_attempts == 0 {
            return Err(Error::Config("poll attempt ceiling must be at least 1".to_string()));
        }

        let result_push = parse_tier("HIOMI_RESULT_PUSH", env("HIOMI_RESULT_PUSH"), toml.result_push, true)?;

        let http_timeout_secs = parse_tier(
            "HIOMI_HTTP_TIMEOUT_SECS",
            env("HIOMI_HTTP_TIMEOUT_SECS"),
            toml.http_timeout_secs,
            defaults.http_timeout.as_secs(),
        )?;

        let max_bytes = parse_tier(
            "HIOMI_MAX_UPLOAD_BYTES",
            env("HIOMI_MAX_UPLOAD_BYTES"),
            toml.max_upload_bytes,
            DEFAULT_MAX_UPLOAD_BYTES,
        )?;

        let accepted_types = match env("HIOMI_ACCEPTED_TYPES").or(toml.accepted_types) {
            Some(spec) => UploadPolicy::parse_accepted_types(&spec)?,
            None => defaults.upload.accepted_types,
        };

        let mut logging = toml.logging;
        if let Some(level) = env("RUST_LOG") {
            logging.level = level;
        }

        let config = Self {
            api_url,
            upload_url,
            result_url,
            default_user_id: env("HIOMI_DEFAULT_USER_ID")
                .or(toml.default_user_id)
                .unwrap_or(defaults.default_user_id),
            default_model: env("HIOMI_DEFAULT_MODEL")
                .or(toml.default_model)
                .unwrap_or(defaults.default_model),
            poll_interval: Duration::from_millis(poll_interval_ms),
            poll_max_attempts,
            result_push,
            result_event: env("HIOMI_RESULT_EVENT")
                .or(toml.result_event)
                .unwrap_or(defaults.result_event),
            http_timeout: Duration::from_secs(http_timeout_secs),
            upload: UploadPolicy {
                max_bytes,
                accepted_types,
            },
            bind_addr: env("HIOMI_BIND_ADDR")
                .or(toml.bind_addr)
                .unwrap_or(defaults.bind_addr),
            logging,
        };

        debug!(?config, "Configuration resolved");
        Ok(config)
    }

    /// `{upload_url}/upload`
    pub fn upload_endpoint(&self) -> String {
        format!("{}/upload", self.upload_url)
    }

    /// `{api_url}/process_image`
    pub fn process_endpoint(&self) -> String {
        format!("{}/process_image", self.api_url)
    }

    /// `{result_url}/results`
    pub fn results_endpoint(&self) -> String {
        format!("{}/results", self.result_url)
    }

    /// `{result_url}/stream`
    pub fn stream_endpoint(&self) -> String {
        format!("{}/stream", self.result_url)
    }
}

/// Environment value (parsed) → TOML value → default
fn parse_tier<T>(key: &str, env_value: Option<String>, toml_value: Option<T>, default: T) -> Result<T>
where
    T: FromStr,
{
    match env_value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key}={raw:?} is not a valid value"))),
        None => Ok(toml_value.unwrap_or(default)),
    }
}

fn normalize_base_url(name: &str, url: &str) -> Result<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(Error::Config(format!("{name} must be an http(s) URL, got {url:?}")));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::resolve(lookup(&[])).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.upload_url, DEFAULT_API_URL);
        assert_eq!(config.result_url, DEFAULT_API_URL);
        assert_eq!(config.default_user_id, "1");
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.poll_max_attempts, 30);
        assert!(config.result_push);
        assert_eq!(config.upload.max_bytes, 20 * 1024 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_overrides_and_url_normalization() {
        let config = ServiceConfig::resolve(lookup(&[
            ("HIOMI_API_URL", "http://localhost:5000/"),
            ("HIOMI_RESULT_URL", "http://localhost:8080//"),
            ("HIOMI_POLL_INTERVAL_MS", "250"),
            ("HIOMI_POLL_MAX_ATTEMPTS", "4"),
            ("HIOMI_RESULT_PUSH", "false"),
        ]))
        .unwrap();

        assert_eq!(config.api_url, "http://localhost:5000");
        assert_eq!(config.upload_url, "http://localhost:5000");
        assert_eq!(config.upload_endpoint(), "http://localhost:5000/upload");
        assert_eq!(config.process_endpoint(), "http://localhost:5000/process_image");
        assert_eq!(config.results_endpoint(), "http://localhost:8080/results");
        assert_eq!(config.stream_endpoint(), "http://localhost:8080/stream");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.poll_max_attempts, 4);
        assert!(!config.result_push);
    }

    #[test]
    fn test_legacy_api_url_variable() {
        let config = ServiceConfig::resolve(lookup(&[("NEXT_PUBLIC_API_URL", "https://backend.test")])).unwrap();
        assert_eq!(config.api_url, "https://backend.test");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ServiceConfig::resolve(lookup(&[("HIOMI_POLL_INTERVAL_MS", "soon")])).is_err());
        assert!(ServiceConfig::resolve(lookup(&[("HIOMI_POLL_INTERVAL_MS", "0")])).is_err());
        assert!(ServiceConfig::resolve(lookup(&[("HIOMI_POLL_MAX_ATTEMPTS", "0")])).is_err());
        assert!(ServiceConfig::resolve(lookup(&[("HIOMI_API_URL", "ftp://x")])).is_err());
    }

    #[test]
    fn test_toml_tier_below_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hiomi.toml");
        std::fs::write(
            &path,
            r#"
            api_url = "http://from-toml:5000"
            default_user_id = "42"
            poll_max_attempts = 10

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        let config = ServiceConfig::resolve(lookup(&[
            ("HIOMI_CONFIG", path.to_str().unwrap()),
            ("HIOMI_POLL_MAX_ATTEMPTS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.api_url, "http://from-toml:5000");
        assert_eq!(config.default_user_id, "42");
        assert_eq!(config.poll_max_attempts, 3);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_toml_file_is_error() {
        let result = ServiceConfig::resolve(lookup(&[("HIOMI_CONFIG", "/nonexistent/hiomi.toml")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_accepted_types() {
        let types = UploadPolicy::parse_accepted_types("image/*=.jpg, png; application/dicom=.DCM").unwrap();
        assert_eq!(types.len(), 2);
        assert_eq!(types[0].extensions, vec![".jpg", ".png"]);
        assert_eq!(types[1].extensions, vec![".dcm"]);

        assert!(UploadPolicy::parse_accepted_types("image/*").is_err());
        assert!(UploadPolicy::parse_accepted_types("").is_err());
    }

    #[test]
    fn test_upload_policy_check() {
        let policy = UploadPolicy::default();

        assert!(policy.check("xray1.png", Some("image/png"), 1024).is_ok());
        assert!(policy.check("XRAY.JPEG", Some("image/jpeg"), 1024).is_ok());
        assert!(policy.check("scan.dcm", Some("application/dicom"), 1024).is_ok());
        assert!(policy.check("scan.dcm", Some("application/octet-stream"), 1024).is_ok());
        assert!(policy.check("scan.dcm", None, 1024).is_ok());

        assert!(policy.check("notes.txt", Some("text/plain"), 10).is_err());
        assert!(policy.check("xray1.png", Some("application/pdf"), 10).is_err());
        assert!(policy.check("noext", None, 10).is_err());
        assert!(policy.check("empty.png", None, 0).is_err());
        assert!(policy.check("big.png", None, DEFAULT_MAX_UPLOAD_BYTES + 1).is_err());
        assert!(policy.check("limit.png", None, DEFAULT_MAX_UPLOAD_BYTES).is_ok());
    }
}
