use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use kiln_jobs::CleanupPolicy;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development against a
/// ComfyUI instance on the same machine.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    pub comfyui: ComfyUIConfig,
    /// Path of the service descriptor file.
    pub services_config: PathBuf,
    /// Directory holding `<template>.json` workflow files.
    pub workflows_dir: PathBuf,
    /// Blob relay settings. `None` disables relay.
    pub blob: Option<BlobConfig>,
    pub cleanup: CleanupConfig,
    /// Whether cancelling a job also stops its engine execution.
    pub cancel_preemptive: bool,
}

#[derive(Debug, Clone)]
pub struct ComfyUIConfig {
    /// `host:port` of the engine, without scheme.
    pub host: String,
    pub secure: bool,
    /// Watchdog for a single execution.
    pub timeout_secs: u64,
}

impl ComfyUIConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub bucket: String,
    pub prefix: String,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub retention_hours: i64,
    pub interval_secs: u64,
    pub policy: CleanupPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                 |
    /// |-----------------------------|-------------------------|
    /// | `HOST`                      | `0.0.0.0`               |
    /// | `PORT`                      | `3000`                  |
    /// | `CORS_ORIGINS`              | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`      | `30`                    |
    /// | `COMFYUI_HOST`              | `127.0.0.1:8188`        |
    /// | `COMFYUI_SECURE`            | `false`                 |
    /// | `COMFYUI_TIMEOUT_SECS`      | `600`                   |
    /// | `SERVICES_CONFIG`           | `config/services.json`  |
    /// | `WORKFLOWS_DIR`             | `workflows`             |
    /// | `S3_BUCKET`                 | unset (relay disabled)  |
    /// | `S3_PREFIX`                 | `kiln`                  |
    /// | `S3_PUBLIC_URL`             | unset                   |
    /// | `JOB_RETENTION_HOURS`       | `24`                    |
    /// | `JOB_CLEANUP_INTERVAL_SECS` | `3600`                  |
    /// | `JOB_CLEANUP_SKIP_ACTIVE`   | `false`                 |
    /// | `JOB_CANCEL_PREEMPTIVE`     | `false`                 |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str, default: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let cors_origins = var("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let comfyui = ComfyUIConfig {
            host: var("COMFYUI_HOST", "127.0.0.1:8188"),
            secure: parse_bool("COMFYUI_SECURE", &var("COMFYUI_SECURE", "false"))?,
            timeout_secs: parse("COMFYUI_TIMEOUT_SECS", &var("COMFYUI_TIMEOUT_SECS", "600"))?,
        };

        let blob = optional("S3_BUCKET").map(|bucket| BlobConfig {
            bucket,
            prefix: var("S3_PREFIX", "kiln"),
            public_url: optional("S3_PUBLIC_URL"),
        });

        let skip_active = parse_bool(
            "JOB_CLEANUP_SKIP_ACTIVE",
            &var("JOB_CLEANUP_SKIP_ACTIVE", "false"),
        )?;
        let cleanup = CleanupConfig {
            retention_hours: parse("JOB_RETENTION_HOURS", &var("JOB_RETENTION_HOURS", "24"))?,
            interval_secs: parse(
                "JOB_CLEANUP_INTERVAL_SECS",
                &var("JOB_CLEANUP_INTERVAL_SECS", "3600"),
            )?,
            policy: if skip_active {
                CleanupPolicy::SkipActive
            } else {
                CleanupPolicy::AgeOnly
            },
        };

        let config = Self {
            host: var("HOST", "0.0.0.0"),
            port: parse("PORT", &var("PORT", "3000"))?,
            cors_origins,
            request_timeout_secs: parse("REQUEST_TIMEOUT_SECS", &var("REQUEST_TIMEOUT_SECS", "30"))?,
            comfyui,
            services_config: PathBuf::from(var("SERVICES_CONFIG", "config/services.json")),
            workflows_dir: PathBuf::from(var("WORKFLOWS_DIR", "workflows")),
            blob,
            cleanup,
            cancel_preemptive: parse_bool(
                "JOB_CANCEL_PREEMPTIVE",
                &var("JOB_CANCEL_PREEMPTIVE", "false"),
            )?,
        };

        if config.comfyui.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "COMFYUI_TIMEOUT_SECS",
                value: "0".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if config.cleanup.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "JOB_CLEANUP_INTERVAL_SECS",
                value: "0".into(),
                reason: "must be greater than zero".into(),
            });
        }

        Ok(config)
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.comfyui.host, "127.0.0.1:8188");
        assert_eq!(config.comfyui.timeout(), Duration::from_secs(600));
        assert!(!config.comfyui.secure);
        assert!(config.blob.is_none());
        assert_eq!(config.cleanup.policy, CleanupPolicy::AgeOnly);
        assert_eq!(config.cleanup.retention_hours, 24);
        assert!(!config.cancel_preemptive);
    }

    #[test]
    fn bucket_enables_blob_relay() {
        let config = load(&[("S3_BUCKET", "renders"), ("S3_PUBLIC_URL", "https://cdn")]).unwrap();
        let blob = config.blob.unwrap();
        assert_eq!(blob.bucket, "renders");
        assert_eq!(blob.prefix, "kiln");
        assert_eq!(blob.public_url.as_deref(), Some("https://cdn"));
    }

    #[test]
    fn skip_active_flag_selects_policy() {
        let config = load(&[("JOB_CLEANUP_SKIP_ACTIVE", "true")]).unwrap();
        assert_eq!(config.cleanup.policy, CleanupPolicy::SkipActive);
    }

    #[test]
    fn invalid_port_is_reported() {
        assert_matches!(
            load(&[("PORT", "http")]),
            Err(ConfigError::Invalid { var: "PORT", .. })
        );
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert_matches!(
            load(&[("COMFYUI_TIMEOUT_SECS", "0")]),
            Err(ConfigError::Invalid { var: "COMFYUI_TIMEOUT_SECS", .. })
        );
    }

    #[test]
    fn cors_origins_are_split() {
        let config = load(&[("CORS_ORIGINS", "http://a, http://b,")]).unwrap();
        assert_eq!(config.cors_origins, ["http://a", "http://b"]);
    }
}
