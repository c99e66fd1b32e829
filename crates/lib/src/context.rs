//! Host/container execution-context detection.
//!
//! Every command starts by asking where it is running: on the bare
//! host, inside a toolbox container, or inside some other container.
//! Container-only commands invoked from inside a toolbox container are
//! forwarded back to the host through flatpak-spawn(1).

use std::env;
use std::io;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use uzers::os::unix::UserExt;

/// Sentinel injected by the container runtime into every container.
const CONTAINER_ENV: &str = "/run/.containerenv";

/// Sentinel written by the toolbox init-container step.
const TOOLBOX_ENV: &str = "/run/.toolboxenv";

/// Environment variables forwarded through flatpak-spawn so that the
/// re-executed command sees the same desktop session as the caller.
const PRESERVED_ENVIRONMENT_VARIABLES: &[&str] = &[
    "COLORTERM",
    "DBUS_SESSION_BUS_ADDRESS",
    "DBUS_SYSTEM_BUS_ADDRESS",
    "DESKTOP_SESSION",
    "DISPLAY",
    "LANG",
    "SHELL",
    "SSH_AUTH_SOCK",
    "TERM",
    "TOOLBOX_PATH",
    "VTE_VERSION",
    "WAYLAND_DISPLAY",
    "XDG_CURRENT_DESKTOP",
    "XDG_DATA_DIRS",
    "XDG_MENU_PREFIX",
    "XDG_RUNTIME_DIR",
    "XDG_SEAT",
    "XDG_SESSION_DESKTOP",
    "XDG_SESSION_ID",
    "XDG_SESSION_TYPE",
    "XDG_VTNR",
];

/// Where this process is running and who invoked it. Derived once at
/// startup and read-only afterwards.
#[derive(Debug)]
pub(crate) struct HostContext {
    /// True when running inside any container.
    pub(crate) in_container: bool,
    /// True when running inside a container created by this tool.
    pub(crate) in_toolbox_container: bool,
    /// Host cgroups hierarchy version; `None` inside a container.
    pub(crate) cgroups_version: Option<u8>,
    pub(crate) uid: u32,
    pub(crate) username: String,
    /// The invoking user's home directory, as recorded in passwd.
    pub(crate) home: Utf8PathBuf,
    pub(crate) shell: String,
    /// Canonicalized path to the current executable.
    pub(crate) executable: Utf8PathBuf,
    pub(crate) executable_base: String,
    pub(crate) working_directory: Utf8PathBuf,
    /// Path under which the toolbox binary is reachable on the host.
    /// Wrapper scripts export `TOOLBOX_PATH`; otherwise it is seeded
    /// from the canonicalized executable path.
    pub(crate) toolbox_path: Utf8PathBuf,
}

impl HostContext {
    /// Probe the filesystem and environment. Fails only when required
    /// state (user lookup, executable path, working directory) cannot
    /// be read.
    #[context("Detecting execution context")]
    pub(crate) fn detect() -> Result<Self> {
        let in_container = Utf8Path::new(CONTAINER_ENV).exists();
        let in_toolbox_container = in_container && Utf8Path::new(TOOLBOX_ENV).exists();

        let cgroups_version = if in_container {
            None
        } else {
            Some(cgroups_version().context("failed to get the cgroups version")?)
        };

        let uid = uzers::get_current_uid();
        let user =
            uzers::get_user_by_uid(uid).ok_or_else(|| anyhow!("failed to get the current user"))?;
        let username = user
            .name()
            .to_str()
            .ok_or_else(|| anyhow!("failed to get the current user's name"))?
            .to_owned();
        let home = Utf8PathBuf::from_path_buf(user.home_dir().to_path_buf())
            .map_err(|_| anyhow!("failed to get the current user's home directory"))?;

        let shell = env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("failed to get the current user's default shell"))?;

        let executable =
            env::current_exe().context("failed to get the path to the executable")?;
        let executable = executable
            .canonicalize()
            .context("failed to resolve absolute path to the executable")?;
        let executable = Utf8PathBuf::from_path_buf(executable)
            .map_err(|_| anyhow!("failed to resolve absolute path to the executable"))?;
        let executable_base = executable
            .file_name()
            .ok_or_else(|| anyhow!("failed to resolve absolute path to the executable"))?
            .to_owned();

        let working_directory = env::current_dir()
            .ok()
            .and_then(|d| Utf8PathBuf::from_path_buf(d).ok())
            .ok_or_else(|| anyhow!("failed to get the working directory"))?;

        let toolbox_path = match env::var("TOOLBOX_PATH") {
            Ok(path) if !path.is_empty() => Utf8PathBuf::from(path),
            _ => executable.clone(),
        };

        Ok(HostContext {
            in_container,
            in_toolbox_container,
            cgroups_version,
            uid,
            username,
            home,
            shell,
            executable,
            executable_base,
            working_directory,
            toolbox_path,
        })
    }
}

/// Cgroups hierarchy version of the host, from the filesystem magic of
/// the cgroup mount. Informational only.
fn cgroups_version() -> Result<u8> {
    let stat = rustix::fs::statfs("/sys/fs/cgroup")?;
    Ok(cgroups_version_for_magic(stat.f_type as i64))
}

fn cgroups_version_for_magic(magic: i64) -> u8 {
    if magic == libc::CGROUP2_SUPER_MAGIC as i64 { 2 } else { 1 }
}

/// `--env=KEY=VALUE` options for every preserved variable the given
/// lookup can resolve.
fn preserved_env_options(lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
    PRESERVED_ENVIRONMENT_VARIABLES
        .iter()
        .filter_map(|variable| {
            lookup(variable).map(|value| format!("--env={variable}={value}"))
        })
        .collect()
}

/// Re-invoke the identical command line on the host through
/// flatpak-spawn(1) and return the forwarded process's exit code.
///
/// stdin and stdout are connected through; stderr only when debug
/// logging is active.
#[context("Forwarding to host")]
pub(crate) fn forward_to_host(ctx: &HostContext) -> Result<i32> {
    let mut command = Command::new("flatpak-spawn");
    command.args(preserved_env_options(|variable| env::var(variable).ok()));
    command.arg("--host");
    command.arg(ctx.toolbox_path.as_str());
    command.args(env::args_os().skip(1));

    if !tracing::enabled!(tracing::Level::DEBUG) {
        command.stderr(Stdio::null());
    }

    tracing::debug!("Forwarding to host: {command:?}");

    let status = match command.status() {
        Ok(status) => status,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            bail!("flatpak-spawn(1) not found")
        }
        Err(err) => return Err(err).context("failed to invoke flatpak-spawn(1)"),
    };

    Ok(status.code().unwrap_or(1))
}
