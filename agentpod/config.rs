use std::path::{Path, PathBuf};

use crate::sandbox::types::{KubeConfig, ProviderConfig};

/// Service account token mounted into every pod.
const IN_CLUSTER_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Process configuration loaded from environment variables.
pub struct Config {
    pub sentry_dsn: Option<String>,
    pub environment: String,
    /// Provider settings file. Missing means defaults.
    pub config_path: PathBuf,
    pub kube: KubeConfig,
    pub namespace: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let token = std::env::var("KUBE_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| std::fs::read_to_string(IN_CLUSTER_TOKEN).ok());
        Self::from_raw_values(
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
            std::env::var("AGENTPOD_CONFIG").ok().as_deref(),
            std::env::var("KUBE_API_URL").ok().as_deref(),
            token.as_deref(),
            std::env::var("KUBE_INSECURE").ok().as_deref(),
            std::env::var("AGENTPOD_NAMESPACE").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        sentry_dsn: Option<&str>,
        environment: Option<&str>,
        config_path: Option<&str>,
        api_url: Option<&str>,
        token: Option<&str>,
        insecure: Option<&str>,
        namespace: Option<&str>,
    ) -> Self {
        let non_empty = |v: Option<&str>| {
            v.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };

        let config_path = non_empty(config_path)
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path);

        let defaults = KubeConfig::default();
        let kube = KubeConfig {
            api_url: non_empty(api_url).unwrap_or(defaults.api_url),
            token: non_empty(token),
            accept_invalid_certs: matches!(
                insecure.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
                Some("1" | "true" | "yes")
            ),
            request_timeout: defaults.request_timeout,
        };

        Config {
            sentry_dsn: non_empty(sentry_dsn),
            environment: non_empty(environment).unwrap_or_else(|| "local".to_string()),
            config_path,
            kube,
            namespace: non_empty(namespace),
        }
    }

    /// Provider settings from `config_path`, with the namespace override
    /// applied.
    pub fn provider_config(&self) -> Result<ProviderConfig, ConfigError> {
        let mut config = if self.config_path.exists() {
            ProviderConfig::from_yaml_file(&self.config_path)?
        } else {
            tracing::debug!(path = %self.config_path.display(), "no config file, using defaults");
            ProviderConfig::default()
        };
        if let Some(ns) = &self.namespace {
            config.namespace = ns.clone();
        }
        Ok(config)
    }
}

/// `~/.agentpod/config.yaml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentpod")
        .join("config.yaml")
}

impl ProviderConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::*;
    use crate::sandbox::types::VolumeType;

    fn raw() -> Config {
        Config::from_raw_values(None, None, None, None, None, None, None)
    }

    #[test]
    fn test_config_defaults() {
        let config = raw();
        assert_eq!(config.environment, "local");
        assert!(config.sentry_dsn.is_none());
        assert!(config.namespace.is_none());
        assert_eq!(config.kube.api_url, "https://kubernetes.default.svc");
        assert!(!config.kube.accept_invalid_certs);
        assert!(config.config_path.ends_with(".agentpod/config.yaml"));
    }

    #[test]
    fn test_config_empty_values_are_none() {
        let config = Config::from_raw_values(Some(""), Some(" "), Some(""), Some(""), Some(""), None, Some(""));
        assert!(config.sentry_dsn.is_none());
        assert_eq!(config.environment, "local");
        assert!(config.kube.token.is_none());
        assert!(config.namespace.is_none());
    }

    #[test]
    fn test_config_present_values() {
        let config = Config::from_raw_values(
            Some("https://sentry.io/123"),
            Some("prod"),
            Some("/etc/agentpod.yaml"),
            Some("https://10.0.0.1:6443"),
            Some("tok\n"),
            Some("TRUE"),
            Some("agents"),
        );
        assert_eq!(config.sentry_dsn.as_deref(), Some("https://sentry.io/123"));
        assert_eq!(config.environment, "prod");
        assert_eq!(config.config_path, PathBuf::from("/etc/agentpod.yaml"));
        assert_eq!(config.kube.api_url, "https://10.0.0.1:6443");
        assert_eq!(config.kube.token.as_deref(), Some("tok"));
        assert!(config.kube.accept_invalid_certs);
        assert_eq!(config.namespace.as_deref(), Some("agents"));
    }

    #[test]
    fn test_provider_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "namespace: team-a\nvolume_type: host-path\nallow_host_path: true\nreadiness_timeout: 45\negress_allowlist:\n  - 10.0.0.0/8\n"
        )
        .unwrap();

        let config = ProviderConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.namespace, "team-a");
        assert_eq!(config.volume_type, VolumeType::HostPath);
        assert!(config.allow_host_path);
        assert_eq!(config.readiness_timeout, Duration::from_secs(45));
        assert_eq!(config.egress_allowlist, vec!["10.0.0.0/8".to_string()]);
        assert!(config.enable_rbac);
    }

    #[test]
    fn test_provider_config_bad_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "volume_type: floppy").unwrap();
        let err = ProviderConfig::from_yaml_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_means_defaults_with_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let config = Config::from_raw_values(
            None,
            None,
            path.to_str(),
            None,
            None,
            None,
            Some("override-ns"),
        );
        let provider = config.provider_config().unwrap();
        assert_eq!(provider.namespace, "override-ns");
        assert_eq!(provider.default_image, ProviderConfig::default().default_image);
    }

    #[test]
    fn test_unreadable_path_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProviderConfig::from_yaml_file(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
