use crate::error::Error;
use crate::upstream::Upstream;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Configuration for a single handler instance.
///
/// One handler supervises the backends of one route block. In static mode
/// (`detector` empty) the handler runs a single backend described by
/// `executable` and `upstream`. In dynamic mode the detector program
/// computes the launch parameters per request, and a separate backend is
/// supervised for every distinct expanded detector command line.
///
/// # Security Warning
///
/// The `executable` and `detector` fields allow arbitrary command
/// execution. Configuration must come from trusted sources only.
#[derive(Debug, Deserialize, Clone)]
pub struct HandlerConfig {
    /// Command tokens for the backend: `[path, arg1, ...]`.
    /// Required unless `detector` is set.
    #[serde(default)]
    pub executable: Vec<String>,

    /// Working directory for the backend (empty means `.`)
    #[serde(default)]
    pub working_dir: String,

    /// `KEY=VALUE` pairs appended to the backend environment
    #[serde(default)]
    pub envs: Vec<String>,

    /// Environment variable names imported from the supervisor's environment
    #[serde(default)]
    pub pass_envs: Vec<String>,

    /// Import the entire supervisor environment before appending `envs`
    #[serde(default)]
    pub pass_all: bool,

    /// Dial target descriptor. Either `[scheme://][host]:port` (host
    /// defaults to loopback, scheme to `http`) or `unix/` followed by an
    /// absolute socket path.
    #[serde(default)]
    pub upstream: String,

    /// HTTP method for the readiness probe. Empty disables HTTP probing;
    /// mandatory for TCP upstreams, optional for Unix sockets (where the
    /// socket's existence is probed instead).
    #[serde(default)]
    pub readiness_method: String,

    /// Path polled by the HTTP readiness probe
    #[serde(default)]
    pub readiness_path: String,

    /// Detector command tokens, with request placeholders in the argument
    /// template. Empty means static mode.
    #[serde(default)]
    pub detector: Vec<String>,

    /// Idle timeout in milliseconds before a backend is terminated
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            executable: Vec::new(),
            working_dir: String::new(),
            envs: Vec::new(),
            pass_envs: Vec::new(),
            pass_all: false,
            upstream: String::new(),
            readiness_method: String::new(),
            readiness_path: String::new(),
            detector: Vec::new(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

fn default_idle_timeout_ms() -> u64 {
    5000
}

impl HandlerConfig {
    /// Create a static-mode config with defaults
    pub fn new(executable: Vec<String>, upstream: &str) -> Self {
        Self {
            executable,
            upstream: upstream.to_string(),
            ..Self::default()
        }
    }

    /// Create a dynamic-mode config driven by a detector command
    pub fn dynamic(detector: Vec<String>) -> Self {
        Self {
            detector,
            ..Self::default()
        }
    }

    /// Set environment pairs (builder pattern)
    pub fn with_envs(mut self, envs: Vec<String>) -> Self {
        self.envs = envs;
        self
    }

    /// Set the HTTP readiness probe (builder pattern)
    pub fn with_readiness(mut self, method: &str, path: &str) -> Self {
        self.readiness_method = method.to_string();
        self.readiness_path = path.to_string();
        self
    }

    /// Set the idle timeout in milliseconds (builder pattern)
    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Load a handler configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        let config: HandlerConfig =
            toml::from_str(&content).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration and normalize the readiness method.
    ///
    /// Static mode requires both an executable and an upstream; a TCP
    /// upstream additionally requires a readiness probe. Dynamic mode is
    /// validated again at every launch once detector overrides are known.
    pub(crate) fn provision(&mut self) -> Result<(), Error> {
        self.readiness_method = self.readiness_method.to_uppercase();

        if self.idle_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "idle_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.detector.is_empty() {
            if self.executable.is_empty() {
                return Err(Error::InvalidConfig(
                    "an executable is required unless a detector is configured".to_string(),
                ));
            }
            if self.upstream.is_empty() {
                return Err(Error::InvalidConfig(
                    "an upstream is required unless a detector is configured".to_string(),
                ));
            }
            let upstream = Upstream::classify(&self.upstream)?;
            if matches!(upstream, Upstream::Tcp { .. }) && self.readiness_method.is_empty() {
                return Err(Error::InvalidConfig(
                    "a TCP upstream requires a readiness probe".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
executable = ["/usr/bin/app", "--serve"]
working_dir = "/srv/app"
envs = ["APP_ENV=prod", "DEBUG=false"]
pass_envs = ["PATH", "HOME"]
upstream = "127.0.0.1:3000"
readiness_method = "GET"
readiness_path = "/health"
idle_timeout_ms = 1500
"#;

        let config: HandlerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.executable, vec!["/usr/bin/app", "--serve"]);
        assert_eq!(config.working_dir, "/srv/app");
        assert_eq!(config.envs.len(), 2);
        assert_eq!(config.pass_envs, vec!["PATH", "HOME"]);
        assert!(!config.pass_all);
        assert_eq!(config.upstream, "127.0.0.1:3000");
        assert_eq!(config.idle_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: HandlerConfig = toml::from_str(
            r#"
executable = ["/bin/app"]
upstream = "unix//tmp/app.sock"
"#,
        )
        .unwrap();

        assert_eq!(config.idle_timeout_ms, 5000);
        assert!(config.working_dir.is_empty());
        assert!(config.readiness_method.is_empty());
        assert!(config.detector.is_empty());
    }

    #[test]
    fn test_provision_normalizes_readiness_method() {
        let mut config = HandlerConfig::new(vec!["/bin/app".into()], "127.0.0.1:3000")
            .with_readiness("get", "/health");
        config.provision().unwrap();
        assert_eq!(config.readiness_method, "GET");
    }

    #[test]
    fn test_provision_static_requires_executable() {
        let mut config = HandlerConfig::new(vec![], "127.0.0.1:3000");
        let err = config.provision().unwrap_err();
        assert_eq!(err.kind(), "INVALID_CONFIG");
    }

    #[test]
    fn test_provision_static_requires_upstream() {
        let mut config = HandlerConfig::new(vec!["/bin/app".into()], "");
        let err = config.provision().unwrap_err();
        assert_eq!(err.kind(), "INVALID_CONFIG");
    }

    #[test]
    fn test_provision_tcp_requires_readiness() {
        let mut config = HandlerConfig::new(vec!["/bin/app".into()], "127.0.0.1:3000");
        let err = config.provision().unwrap_err();
        assert_eq!(err.kind(), "INVALID_CONFIG");
        assert!(err.to_string().contains("readiness"));
    }

    #[cfg(unix)]
    #[test]
    fn test_provision_unix_upstream_allows_missing_readiness() {
        let mut config = HandlerConfig::new(vec!["/bin/app".into()], "unix//tmp/app.sock");
        config.provision().unwrap();
    }

    #[test]
    fn test_provision_dynamic_mode_skips_static_checks() {
        let mut config = HandlerConfig::dynamic(vec!["/bin/detect".into(), "{path}".into()]);
        config.provision().unwrap();
    }

    #[test]
    fn test_provision_rejects_zero_idle_timeout() {
        let mut config =
            HandlerConfig::new(vec!["/bin/app".into()], "unix//tmp/app.sock").with_idle_timeout_ms(0);
        let err = config.provision().unwrap_err();
        assert_eq!(err.kind(), "INVALID_CONFIG");
    }

    #[test]
    fn test_provision_rejects_bad_upstream() {
        let mut config = HandlerConfig::new(vec!["/bin/app".into()], "http://[::bad");
        let err = config.provision().unwrap_err();
        assert_eq!(err.kind(), "INVALID_UPSTREAM");
    }
}
