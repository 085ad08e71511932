//! Detector execution and launch-parameter merging.
//!
//! In dynamic mode the expanded detector command line doubles as the
//! supervisor key; running it yields a JSON object of optional overrides
//! that are merged onto the configured defaults.

use crate::config::HandlerConfig;
use crate::error::Error;
use crate::process;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Wall-clock deadline for one detector run.
const DETECTOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Overrides decoded from the detector's standard output.
///
/// Every field is optional and nullable; a present field replaces the
/// corresponding configured default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectorOverrides {
    pub executable: Option<Vec<String>>,
    pub working_directory: Option<String>,
    pub envs: Option<Vec<String>>,
    pub reverse_proxy_to: Option<String>,
    pub readiness_method: Option<String>,
    pub readiness_path: Option<String>,
}

/// Effective launch parameters for one backend, after merging detector
/// overrides onto the configured defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    pub executable: Vec<String>,
    pub working_dir: String,
    pub envs: Vec<String>,
    pub upstream: String,
    pub readiness_method: String,
    pub readiness_path: String,
}

impl LaunchParams {
    /// Parameters for static mode: the configuration as-is.
    pub fn from_config(config: &HandlerConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            working_dir: config.working_dir.clone(),
            envs: config.envs.clone(),
            upstream: config.upstream.clone(),
            readiness_method: config.readiness_method.clone(),
            readiness_path: config.readiness_path.clone(),
        }
    }

    /// Merge detector overrides onto the configured defaults. An absent
    /// field keeps the default; an empty executable list is treated as
    /// absent. The readiness method is normalized to upper-case so that
    /// detector output follows the same rules as configuration.
    pub fn merged(config: &HandlerConfig, overrides: DetectorOverrides) -> Self {
        Self {
            executable: overrides
                .executable
                .filter(|exec| !exec.is_empty())
                .unwrap_or_else(|| config.executable.clone()),
            working_dir: overrides
                .working_directory
                .unwrap_or_else(|| config.working_dir.clone()),
            envs: overrides.envs.unwrap_or_else(|| config.envs.clone()),
            upstream: overrides
                .reverse_proxy_to
                .unwrap_or_else(|| config.upstream.clone()),
            readiness_method: overrides
                .readiness_method
                .map(|m| m.to_uppercase())
                .unwrap_or_else(|| config.readiness_method.clone()),
            readiness_path: overrides
                .readiness_path
                .unwrap_or_else(|| config.readiness_path.clone()),
        }
    }
}

/// Run the detector for a key and decode its overrides.
///
/// The key is the expanded detector command line; it is split on single
/// spaces into argv. The detector runs in its own process group with a
/// parent-death signal where the platform supports it, so it cannot
/// outlive the supervisor.
pub(crate) async fn run_detector(key: &str) -> Result<DetectorOverrides, Error> {
    let argv: Vec<&str> = key.split(' ').collect();
    let (program, args) = match argv.split_first() {
        Some((program, args)) if !program.is_empty() => (*program, args),
        _ => {
            return Err(Error::InvalidConfig(
                "detector command expanded to an empty program".to_string(),
            ))
        }
    };

    debug!(command = program, args = ?args, "running detector");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    process::set_process_group(&mut cmd);

    let output = match tokio::time::timeout(DETECTOR_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(Error::DetectorFailed {
                detail: e.to_string(),
                stdout: String::new(),
            })
        }
        // Dropping the in-flight command kills the detector.
        Err(_) => return Err(Error::DetectorTimeout),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        info!(stderr = %stderr, "detector stderr");
    }

    if !output.status.success() {
        return Err(Error::DetectorFailed {
            detail: output.status.to_string(),
            stdout,
        });
    }

    serde_json::from_str(&stdout).map_err(|error| Error::DetectorBadOutput { error, stdout })
}
