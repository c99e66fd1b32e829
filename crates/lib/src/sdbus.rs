//! Service-bus queries through busctl(1).
//!
//! Two collaborators live on the buses: the Flatpak session helper,
//! which hands out the monitor path mounted into every container, and
//! systemd's socket unit for the sssd Kerberos credential cache. Both
//! are queried with `busctl --json=short` and decoded explicitly; an
//! unexpected reply shape is an error, never a silent coercion.

use std::process::Command;

use anyhow::{Result, anyhow, bail};
use camino::Utf8PathBuf;
use fn_error_context::context;
use serde::Deserialize;
use serde_json::Value;
use toolbox_utils::CommandRunExt;

/// `busctl --json=short` wraps every reply in a type/data envelope.
#[derive(Debug, Deserialize)]
struct BusReply {
    data: Value,
}

/// Ask the Flatpak session helper for the monitor path, the host
/// directory that tracks session state for sandboxed processes.
#[context("Calling org.freedesktop.Flatpak.SessionHelper.RequestSession")]
pub(crate) fn flatpak_session_helper_monitor_path() -> Result<Utf8PathBuf> {
    tracing::debug!("Calling org.freedesktop.Flatpak.SessionHelper.RequestSession");

    let reply: BusReply = Command::new("busctl")
        .args([
            "call",
            "--user",
            "--json=short",
            "org.freedesktop.Flatpak",
            "/org/freedesktop/Flatpak/SessionHelper",
            "org.freedesktop.Flatpak.SessionHelper",
            "RequestSession",
        ])
        .log_debug()
        .run_and_parse_json()?;

    let path = monitor_path_from_reply(&reply.data)?;
    Ok(Utf8PathBuf::from(path))
}

/// Extract the string-typed `path` entry from a RequestSession reply.
fn monitor_path_from_reply(data: &Value) -> Result<&str> {
    let unknown = || anyhow!("unknown reply from org.freedesktop.Flatpak.SessionHelper");

    let dict = data
        .as_array()
        .and_then(|args| args.first())
        .and_then(Value::as_object)
        .ok_or_else(unknown)?;
    let variant = dict.get("path").and_then(Value::as_object).ok_or_else(unknown)?;
    if variant.get("type").and_then(Value::as_str) != Some("s") {
        return Err(unknown());
    }
    variant
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(unknown)
}

/// Resolve the Kerberos credential-cache socket from the `Listen`
/// property of sssd-kcm.socket. Callers treat failure as absence.
#[context("Resolving the sssd-kcm socket")]
pub(crate) fn kcm_socket_path() -> Result<Utf8PathBuf> {
    tracing::debug!("Resolving the path to the sssd-kcm socket");

    let reply: BusReply = Command::new("busctl")
        .args([
            "get-property",
            "--json=short",
            "org.freedesktop.systemd1",
            "/org/freedesktop/systemd1/unit/sssd_2dkcm_2esocket",
            "org.freedesktop.systemd1.Socket",
            "Listen",
        ])
        .log_debug()
        .run_and_parse_json()?;

    for path in stream_socket_paths(&reply.data)? {
        // Relative paths are abstract sockets; skip them.
        if !path.starts_with('/') {
            continue;
        }
        match Utf8PathBuf::from(path).canonicalize_utf8() {
            Ok(resolved) => return Ok(resolved),
            Err(err) => tracing::debug!("skipping {path}: {err}"),
        }
    }

    bail!("failed to find a SOCK_STREAM socket for sssd-kcm.socket")
}

/// The `Stream` entries of a systemd `Listen` property, an array of
/// (kind, address) pairs.
fn stream_socket_paths(data: &Value) -> Result<Vec<&str>> {
    let entries: Vec<(&str, &str)> = data
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let pair = entry.as_array()?;
                    Some((pair.first()?.as_str()?, pair.get(1)?.as_str()?))
                })
                .collect()
        })
        .ok_or_else(|| anyhow!("failed to parse the Listen property of sssd-kcm.socket"))?;

    Ok(entries
        .into_iter()
        .filter(|(kind, _)| *kind == "Stream")
        .map(|(_, address)| address)
        .collect())
}
