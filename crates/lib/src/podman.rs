//! Gateway to the Podman container engine.
//!
//! Every query or mutation of container and image state goes through
//! [`Podman`]: run a podman subcommand, capture its output, map the
//! exit status to a typed error, and decode structured replies from
//! JSON into explicit result types.

use std::collections::HashMap;
use std::io::Write as _;
use std::process::{Command, ExitStatus};

use anyhow::{Context, Result, anyhow};
use fn_error_context::context;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors podman reports through its exit status.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum EngineError {
    /// Exit 1: an `rm`/`rmi` target does not exist.
    #[error("does not exist")]
    NonExistent,
    /// Exit 2: an `rm` target is running or paused, or an `rmi` target
    /// has dependent children.
    #[error("is running, paused or has dependent children")]
    Busy,
    /// Exit 125: an error in podman itself.
    #[error("internal error in podman")]
    Internal,
    /// Exit 126: a contained command cannot be invoked.
    #[error("contained command cannot be invoked")]
    CommandCannotInvoke,
    /// Exit 127: a contained command cannot be found.
    #[error("contained command cannot be found")]
    CommandNotFound,
    /// Any other non-zero status, including death by signal.
    #[error("podman exited with status {0}")]
    Other(i32),
}

/// Failures specific to pulling an image from a registry, classified
/// from podman's stderr.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum PullError {
    #[error("invalid status code from registry 503 (Service Unavailable)")]
    ServiceUnavailable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("manifest unknown")]
    UnknownManifest,
}

fn engine_error_for_code(code: i32) -> EngineError {
    match code {
        1 => EngineError::NonExistent,
        2 => EngineError::Busy,
        125 => EngineError::Internal,
        126 => EngineError::CommandCannotInvoke,
        127 => EngineError::CommandNotFound,
        other => EngineError::Other(other),
    }
}

fn check_status(status: ExitStatus) -> Result<(), EngineError> {
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(engine_error_for_code(code)),
        // Killed by a signal.
        None => Err(EngineError::Other(-1)),
    }
}

/// Classify a failed pull from the known stderr patterns.
fn classify_pull_stderr(stderr: &str) -> Option<PullError> {
    if stderr.contains("invalid status code from registry 503 (Service Unavailable)")
        || stderr.contains("received unexpected HTTP status: 503 Service Temporarily Unavailable")
    {
        Some(PullError::ServiceUnavailable)
    } else if stderr.contains("read: connection refused") {
        Some(PullError::ConnectionRefused)
    } else if stderr.contains("manifest unknown: manifest unknown") {
        Some(PullError::UnknownManifest)
    } else {
        None
    }
}

/// `podman version --format json` reply. Old podman reports a
/// top-level `Version`, newer ones nest it under `Client`.
#[derive(Debug, Deserialize)]
pub(crate) struct VersionOutput {
    #[serde(rename = "Client")]
    client: Option<ClientVersion>,
    #[serde(rename = "Version")]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientVersion {
    #[serde(rename = "Version")]
    version: String,
}

impl VersionOutput {
    pub(crate) fn version(&self) -> Result<&str> {
        self.client
            .as_ref()
            .map(|client| client.version.as_str())
            .or(self.version.as_deref())
            .ok_or_else(|| anyhow!("no version in the output of 'podman version'"))
    }
}

/// One entry of `podman ps --format json`.
#[derive(Debug, Deserialize)]
pub(crate) struct PsEntry {
    /// Container id; podman has spelled this key both ways.
    #[serde(alias = "Id", alias = "ID")]
    pub(crate) id: String,
}

/// The slice of `podman inspect --type container` the core reads.
#[derive(Debug, Deserialize)]
pub(crate) struct ContainerInspect {
    #[serde(rename = "Config")]
    pub(crate) config: ContainerConfig,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    pub(crate) labels: Option<HashMap<String, String>>,
}

/// The slice of `podman inspect --type image` the core reads.
#[derive(Debug, Deserialize)]
pub(crate) struct ImageInspect {
    #[serde(rename = "RepoTags", default)]
    pub(crate) repo_tags: Option<Vec<String>>,
}

/// Handle on the podman binary, carrying the logging configuration
/// threaded in from the command line.
#[derive(Debug, Clone)]
pub(crate) struct Podman {
    log_level: String,
    log_output: bool,
}

impl Podman {
    pub(crate) fn new(log_level: &str, log_output: bool) -> Self {
        Podman {
            log_level: log_level.to_owned(),
            log_output,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new("podman");
        command.args(["--log-level", &self.log_level]);
        command.args(args);
        command
    }

    /// Run a podman subcommand, returning its standard output. The
    /// captured stderr is echoed when podman logging is enabled, and
    /// folded into the typed error on failure.
    fn output(&self, args: &[&str]) -> Result<Vec<u8>> {
        tracing::debug!("running podman {}", args.join(" "));
        let output = self
            .command(args)
            .output()
            .context("failed to invoke podman(1)")?;

        if self.log_output {
            // Don't panic if writing fails.
            let _ = std::io::stderr().write_all(&output.stderr);
        }

        check_status(output.status).map_err(|err| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::Error::new(err).context(format!("podman {}: {}", args[0], stderr.trim()))
        })?;
        Ok(output.stdout)
    }

    fn parse<T: DeserializeOwned>(output: &[u8], what: &str) -> Result<T> {
        serde_json::from_slice(output)
            .with_context(|| format!("failed to parse the output of 'podman {what}'"))
    }

    /// The version of the podman binary.
    #[context("Querying the podman version")]
    pub(crate) fn version(&self) -> Result<String> {
        let output = self.output(&["version", "--format", "json"])?;
        let version: VersionOutput = Self::parse(&output, "version")?;
        Ok(version.version()?.to_owned())
    }

    /// True when the podman version is at least `minimum`. Any failure
    /// to query or parse the version counts as "too old".
    pub(crate) fn check_version(&self, minimum: &str) -> bool {
        match self.version() {
            Ok(version) => version_at_least(&version, minimum),
            Err(err) => {
                tracing::debug!("{err:#}");
                false
            }
        }
    }

    /// Inspect a single container.
    #[context("Inspecting container {}", container)]
    pub(crate) fn inspect_container(&self, container: &str) -> Result<ContainerInspect> {
        let output = self.output(&[
            "inspect",
            "--format",
            "json",
            "--type",
            "container",
            container,
        ])?;
        let mut info: Vec<ContainerInspect> = Self::parse(&output, "inspect")?;
        if info.is_empty() {
            return Err(anyhow!("failed to parse the output of 'podman inspect'"));
        }
        Ok(info.swap_remove(0))
    }

    /// Inspect a single image.
    #[context("Inspecting image {}", image)]
    pub(crate) fn inspect_image(&self, image: &str) -> Result<ImageInspect> {
        let output =
            self.output(&["inspect", "--format", "json", "--type", "image", image])?;
        let mut info: Vec<ImageInspect> = Self::parse(&output, "inspect")?;
        if info.is_empty() {
            return Err(anyhow!("failed to parse the output of 'podman inspect'"));
        }
        Ok(info.swap_remove(0))
    }

    /// List containers, with extra `podman ps` arguments (filters).
    #[context("Listing containers")]
    pub(crate) fn get_containers(&self, args: &[&str]) -> Result<Vec<PsEntry>> {
        let mut full = vec!["ps", "--format", "json"];
        full.extend_from_slice(args);
        let output = self.output(&full)?;
        Self::parse(&output, "ps")
    }

    /// Whether an image with the given name or id exists locally.
    pub(crate) fn image_exists(&self, image: &str) -> Result<bool> {
        self.exists(&["image", "exists", image])
    }

    /// Whether a container with the given name or id exists.
    pub(crate) fn container_exists(&self, container: &str) -> Result<bool> {
        self.exists(&["container", "exists", container])
    }

    fn exists(&self, args: &[&str]) -> Result<bool> {
        tracing::debug!("running podman {}", args.join(" "));
        let output = self
            .command(args)
            .output()
            .context("failed to invoke podman(1)")?;
        if self.log_output {
            let _ = std::io::stderr().write_all(&output.stderr);
        }
        match check_status(output.status) {
            Ok(()) => Ok(true),
            Err(EngineError::NonExistent) => Ok(false),
            Err(err) => Err(anyhow::Error::new(err).context("podman exists query failed")),
        }
    }

    /// Pull an image from a registry. Failures are classified into
    /// [`PullError`] kinds when the stderr matches a known pattern.
    #[context("Pulling image {}", image)]
    pub(crate) fn pull(&self, image: &str) -> Result<()> {
        let output = self
            .command(&["pull", image])
            .output()
            .context("failed to invoke podman(1)")?;

        if self.log_output {
            let _ = std::io::stderr().write_all(&output.stderr);
        }

        if let Err(err) = check_status(output.status) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return match classify_pull_stderr(&stderr) {
                Some(pull_error) => Err(anyhow::Error::new(pull_error)),
                None => Err(anyhow::Error::new(err)
                    .context(format!("podman pull: {}", stderr.trim()))),
            };
        }
        Ok(())
    }

    /// Create a container from a fully assembled argument list.
    pub(crate) fn create(&self, args: &[String]) -> Result<()> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.output(&args).map(|_| ())
    }

    /// Remove a container. The [`EngineError`] kind stays available for
    /// downcasting, so callers can distinguish "running" from "absent".
    pub(crate) fn rm(&self, container: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("--force");
        }
        args.push(container);
        self.output(&args).map(|_| ())
    }
}

/// Compare dotted, podman-style version strings ("4.9.3", "1.5.0-dev")
/// by their leading numeric components.
fn version_at_least(version: &str, minimum: &str) -> bool {
    fn components(version: &str) -> Vec<u64> {
        version
            .split(['.', '-'])
            .map_while(|part| part.parse().ok())
            .collect()
    }

    let version = components(version);
    let minimum = components(minimum);
    let len = version.len().max(minimum.len());
    for i in 0..len {
        let have = version.get(i).copied().unwrap_or(0);
        let want = minimum.get(i).copied().unwrap_or(0);
        if have != want {
            return have > want;
        }
    }
    true
}
