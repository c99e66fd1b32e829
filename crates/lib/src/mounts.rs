//! Bind-mount topology for new toolbox containers.
//!
//! The host filesystem layout varies in ways that change what a new
//! container must be given: `/home`, `/media` and `/mnt` may be
//! symbolic links into `/var` or `/run` (in which case the container
//! recreates the link itself instead of receiving a duplicate bind
//! mount), and `/usr` may be intentionally writable. Host-side mount
//! events must propagate into the container, so shared trees use
//! `rslave` propagation.

use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;
use toolbox_utils::CommandRunExt;

use crate::context::HostContext;
use crate::sdbus;

/// Fallback D-Bus system bus address when the variable is unset.
const DBUS_SYSTEM_BUS_ADDRESS_DEFAULT: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// Candidate sources for the in-container profile script, first match
/// wins.
const PROFILE_SCRIPT_SOURCES: &[&str] = &[
    "/etc/profile.d/toolbox.sh",
    "/usr/share/profile.d/toolbox.sh",
];

/// How an optional host tree maps into the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OptionalTree {
    /// The source does not exist; nothing is emitted.
    Absent,
    /// The source is a symlink to its known backing directory; the
    /// in-container init recreates the link (a topology flag).
    Link,
    /// A real directory; emit an `rslave` bind mount.
    Mount,
}

/// Everything the topology computation needs from the host, gathered
/// up front so the assembly itself stays deterministic and testable.
#[derive(Debug)]
pub(crate) struct TopologyInputs {
    pub(crate) dbus_system_socket: Utf8PathBuf,
    pub(crate) monitor_path: Utf8PathBuf,
    /// The invoking user's home directory, canonicalized.
    pub(crate) home: Utf8PathBuf,
    pub(crate) toolbox_path: Utf8PathBuf,
    pub(crate) usr_read_write: bool,
    pub(crate) xdg_runtime_dir: String,
    pub(crate) kcm_socket: Option<Utf8PathBuf>,
    pub(crate) slash_home: OptionalTree,
    pub(crate) media: OptionalTree,
    pub(crate) mnt: OptionalTree,
    pub(crate) run_media_exists: bool,
    pub(crate) profile_script: Option<Utf8PathBuf>,
}

/// The computed mount specification: `--volume` values in their final
/// order, plus the topology flags handed to the in-container init.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MountTopology {
    pub(crate) volumes: Vec<String>,
    pub(crate) home_link: bool,
    pub(crate) media_link: bool,
    pub(crate) mnt_link: bool,
}

/// Compute the mount specification from gathered inputs. Every mount
/// destination is unique; absent optional sources are omitted.
pub(crate) fn assemble(inputs: &TopologyInputs) -> MountTopology {
    let usr_mode = if inputs.usr_read_write { "rw" } else { "ro" };
    let dbus = &inputs.dbus_system_socket;
    let home = &inputs.home;
    let xdg = &inputs.xdg_runtime_dir;

    let mut volumes = vec![
        "/etc:/run/host/etc".to_owned(),
        "/dev:/dev:rslave".to_owned(),
        "/run:/run/host/run:rslave".to_owned(),
        "/tmp:/run/host/tmp:rslave".to_owned(),
        "/var:/run/host/var:rslave".to_owned(),
        format!("{dbus}:{dbus}"),
        format!("{}:/run/host/monitor", inputs.monitor_path),
        format!("{home}:{home}:rslave"),
    ];

    if inputs.slash_home == OptionalTree::Mount {
        volumes.push("/home:/home:rslave".to_owned());
    }

    volumes.push(format!("{}:/usr/bin/toolbox:ro", inputs.toolbox_path));
    volumes.push(format!("/usr:/run/host/usr:{usr_mode},rslave"));
    volumes.push(format!("{xdg}:{xdg}"));

    if let Some(kcm) = &inputs.kcm_socket {
        volumes.push(format!("{kcm}:{kcm}"));
    }
    if inputs.media == OptionalTree::Mount {
        volumes.push("/media:/media:rslave".to_owned());
    }
    if inputs.mnt == OptionalTree::Mount {
        volumes.push("/mnt:/mnt:rslave".to_owned());
    }
    if inputs.run_media_exists {
        volumes.push("/run/media:/run/media:rslave".to_owned());
    }
    if let Some(script) = &inputs.profile_script {
        volumes.push(format!("{script}:/etc/profile.d/toolbox.sh:ro"));
    }

    MountTopology {
        volumes,
        home_link: inputs.slash_home == OptionalTree::Link,
        media_link: inputs.media == OptionalTree::Link,
        mnt_link: inputs.mnt == OptionalTree::Link,
    }
}

/// Probe the host for everything [`assemble`] needs. Optional
/// resources that cannot be resolved are recorded as absent; required
/// ones (D-Bus system socket, home directory) fail hard.
#[context("Gathering the container mount topology")]
pub(crate) fn probe(ctx: &HostContext) -> Result<TopologyInputs> {
    let address = env::var("DBUS_SYSTEM_BUS_ADDRESS")
        .unwrap_or_else(|_| DBUS_SYSTEM_BUS_ADDRESS_DEFAULT.to_owned());
    let dbus_system_socket = dbus_socket_from_address(&address)?
        .canonicalize_utf8()
        .map_err(|_| anyhow!("failed to resolve the path to the D-Bus system socket"))?;

    let monitor_path = sdbus::flatpak_session_helper_monitor_path()?;

    let home = ctx
        .home
        .canonicalize_utf8()
        .with_context(|| format!("failed to canonicalize {}", ctx.home))?;
    tracing::debug!("{} canonicalized to {home}", ctx.home);

    let usr_read_write = is_usr_read_write()?;
    tracing::debug!(
        "/usr is mounted {}",
        if usr_read_write { "read-write" } else { "read-only" }
    );

    let xdg_runtime_dir = env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    // The only locally recovered failure: no Kerberos socket is fine.
    let kcm_socket = match sdbus::kcm_socket_path() {
        Ok(path) => Some(path),
        Err(err) => {
            tracing::debug!("{err:#}");
            None
        }
    };

    let slash_home = classify_tree(Utf8Path::new("/home"), "var/home");
    let media = classify_tree(Utf8Path::new("/media"), "run/media");
    let mnt = classify_tree(Utf8Path::new("/mnt"), "var/mnt");
    let run_media_exists = Utf8Path::new("/run/media").exists();

    let profile_script = PROFILE_SCRIPT_SOURCES
        .iter()
        .map(Utf8Path::new)
        .find(|source| source.exists())
        .map(Utf8Path::to_path_buf);
    if let Some(script) = &profile_script {
        tracing::debug!("Found {script}");
    }

    Ok(TopologyInputs {
        dbus_system_socket,
        monitor_path,
        home,
        toolbox_path: ctx.toolbox_path.clone(),
        usr_read_write,
        xdg_runtime_dir,
        kcm_socket,
        slash_home,
        media,
        mnt,
        run_media_exists,
        profile_script,
    })
}

/// Extract the socket path from a D-Bus address of the exact form
/// `unix:path=<path>`.
fn dbus_socket_from_address(address: &str) -> Result<Utf8PathBuf> {
    let parts: Vec<&str> = address.split('=').collect();
    match parts.as_slice() {
        ["unix:path", path] if !path.is_empty() => Ok(Utf8PathBuf::from(*path)),
        _ => bail!("failed to get the path to the D-Bus system socket"),
    }
}

/// Classify one of the optional shared trees by looking at its symlink
/// target; `expected` is the known backing directory, accepted in both
/// relative and absolute spelling.
fn classify_tree(path: &Utf8Path, expected: &str) -> OptionalTree {
    if !path.exists() {
        return OptionalTree::Absent;
    }
    match fs::read_link(path) {
        Ok(target) => classify_link_target(&target, expected),
        Err(_) => OptionalTree::Mount,
    }
}

fn classify_link_target(target: &Path, expected: &str) -> OptionalTree {
    let absolute = format!("/{expected}");
    if target == Path::new(expected) || target == Path::new(&absolute) {
        OptionalTree::Link
    } else {
        OptionalTree::Mount
    }
}

/// `findmnt --json` output, trimmed to the options column.
#[derive(Debug, Deserialize)]
struct FindmntOutput {
    filesystems: Vec<FindmntFilesystem>,
}

#[derive(Debug, Deserialize)]
struct FindmntFilesystem {
    options: String,
}

/// Whether the mount backing `/usr` is writable on the host.
fn is_usr_read_write() -> Result<bool> {
    tracing::debug!("Checking if /usr is mounted read-only or read-write");
    let output: FindmntOutput = Command::new("findmnt")
        .args(["--json", "--output", "OPTIONS", "--target", "/usr"])
        .log_debug()
        .run_and_parse_json()
        .context("failed to get the mount options of /usr")?;
    let filesystem = output
        .filesystems
        .first()
        .ok_or_else(|| anyhow!("failed to get the mount-point of /usr"))?;
    Ok(!mount_options_contain_ro(&filesystem.options))
}

fn mount_options_contain_ro(options: &str) -> bool {
    options.split(',').any(|option| option == "ro")
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn inputs() -> TopologyInputs {
        TopologyInputs {
            dbus_system_socket: "/run/dbus/system_bus_socket".into(),
            monitor_path: "/run/user/1000/.flatpak-helper/monitor".into(),
            home: "/var/home/user".into(),
            toolbox_path: "/usr/bin/toolbox".into(),
            usr_read_write: false,
            xdg_runtime_dir: "/run/user/1000".to_owned(),
            kcm_socket: None,
            slash_home: OptionalTree::Mount,
            media: OptionalTree::Absent,
            mnt: OptionalTree::Mount,
            run_media_exists: false,
            profile_script: None,
        }
    }

    #[test]
    fn symlinked_home_becomes_a_flag_not_a_mount() {
        let mut inputs = inputs();
        inputs.slash_home = OptionalTree::Link;
        let topology = assemble(&inputs);
        assert!(topology.home_link);
        assert!(!topology.volumes.iter().any(|v| v.starts_with("/home:")));
    }

    #[test]
    fn regular_home_is_a_single_rslave_mount() {
        let topology = assemble(&inputs());
        assert!(!topology.home_link);
        let home_mounts: Vec<&String> = topology
            .volumes
            .iter()
            .filter(|v| v.starts_with("/home:"))
            .collect();
        assert_eq!(home_mounts, ["/home:/home:rslave"]);
    }

    #[test]
    fn absent_media_is_omitted() {
        let topology = assemble(&inputs());
        assert!(!topology.media_link);
        assert!(!topology.volumes.iter().any(|v| v.contains("/media")));
    }

    #[test]
    fn symlinked_media_and_mnt_become_flags() {
        let mut inputs = inputs();
        inputs.media = OptionalTree::Link;
        inputs.mnt = OptionalTree::Link;
        let topology = assemble(&inputs);
        assert!(topology.media_link);
        assert!(topology.mnt_link);
        assert!(!topology.volumes.iter().any(|v| v.starts_with("/mnt:")));
    }

    #[test]
    fn usr_mode_follows_host_writability() {
        let read_only = assemble(&inputs());
        assert!(read_only.volumes.contains(&"/usr:/run/host/usr:ro,rslave".to_owned()));

        let mut inputs = inputs();
        inputs.usr_read_write = true;
        let writable = assemble(&inputs);
        assert!(writable.volumes.contains(&"/usr:/run/host/usr:rw,rslave".to_owned()));
    }

    #[test]
    fn optional_sources_are_appended_in_order() {
        let mut inputs = inputs();
        inputs.kcm_socket = Some("/var/run/.heim_org.h5l.kcm-socket".into());
        inputs.run_media_exists = true;
        inputs.profile_script = Some("/etc/profile.d/toolbox.sh".into());
        let topology = assemble(&inputs);
        let tail: Vec<&str> = topology
            .volumes
            .iter()
            .rev()
            .take(4)
            .rev()
            .map(String::as_str)
            .collect();
        assert_eq!(
            tail,
            [
                "/var/run/.heim_org.h5l.kcm-socket:/var/run/.heim_org.h5l.kcm-socket",
                "/mnt:/mnt:rslave",
                "/run/media:/run/media:rslave",
                "/etc/profile.d/toolbox.sh:/etc/profile.d/toolbox.sh:ro",
            ]
        );
    }

    #[test]
    fn mount_destinations_are_unique() {
        let mut inputs = inputs();
        inputs.kcm_socket = Some("/var/run/kcm".into());
        inputs.media = OptionalTree::Mount;
        inputs.run_media_exists = true;
        inputs.profile_script = Some("/usr/share/profile.d/toolbox.sh".into());
        let topology = assemble(&inputs);
        let mut destinations: Vec<&str> = topology
            .volumes
            .iter()
            .map(|v| v.split(':').nth(1).unwrap())
            .collect();
        destinations.sort_unstable();
        let before = destinations.len();
        destinations.dedup();
        assert_eq!(destinations.len(), before);
    }

    #[test]
    fn dbus_address_of_exact_shape_is_parsed() -> Result<()> {
        assert_eq!(
            dbus_socket_from_address("unix:path=/var/run/dbus/system_bus_socket")?,
            Utf8PathBuf::from("/var/run/dbus/system_bus_socket")
        );
        Ok(())
    }

    #[test]
    fn malformed_dbus_addresses_are_rejected() {
        for address in [
            "",
            "unix:path",
            "unix:path=",
            "unix:path=/a=/b",
            "tcp:host=localhost",
            "unix:abstract=/tmp/x",
        ] {
            assert!(dbus_socket_from_address(address).is_err(), "{address:?}");
        }
    }

    #[test]
    fn link_targets_match_both_spellings() {
        assert_eq!(
            classify_link_target(Path::new("var/home"), "var/home"),
            OptionalTree::Link
        );
        assert_eq!(
            classify_link_target(Path::new("/var/home"), "var/home"),
            OptionalTree::Link
        );
        assert_eq!(
            classify_link_target(Path::new("/somewhere/else"), "var/home"),
            OptionalTree::Mount
        );
    }

    #[test]
    fn classify_tree_on_real_paths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let real = dir.path().join("real");
        std::fs::create_dir(&real)?;
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("real", &link)?;
        let missing = dir.path().join("missing");

        let real = Utf8PathBuf::from_path_buf(real).unwrap();
        let link = Utf8PathBuf::from_path_buf(link).unwrap();
        let missing = Utf8PathBuf::from_path_buf(missing).unwrap();

        assert_eq!(classify_tree(&real, "real"), OptionalTree::Mount);
        assert_eq!(classify_tree(&link, "real"), OptionalTree::Link);
        assert_eq!(classify_tree(&missing, "real"), OptionalTree::Absent);
        Ok(())
    }

    #[test]
    fn ro_option_detection_is_token_based() {
        assert!(mount_options_contain_ro("ro,seclabel,nosuid"));
        assert!(mount_options_contain_ro("rw,errors=remount-ro,ro"));
        assert!(!mount_options_contain_ro("rw,seclabel"));
        // Substring matches must not count.
        assert!(!mount_options_contain_ro("rw,errors=remount-ro"));
    }
}
