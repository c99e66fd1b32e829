//! Removal of toolbox containers.
//!
//! Only containers carrying the toolbox labels are ever removed. The
//! `--all` path lists both label generations and deduplicates by
//! container id, since a container may carry both.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result, bail};
use fn_error_context::context;

use crate::podman::{EngineError, Podman, PsEntry};

/// Label filters that identify toolbox containers, older and newer
/// generation.
const TOOLBOX_LABEL_FILTERS: &[&str] = &[
    "label=com.redhat.component=fedora-toolbox",
    "label=com.github.debarshiray.toolbox=true",
];

/// Remove the named containers, or all toolbox containers.
pub(crate) fn rm(podman: &Podman, containers: &[String], all: bool, force: bool) -> Result<()> {
    if all {
        for id in all_toolbox_container_ids(podman)? {
            remove(podman, &id, force)?;
        }
        return Ok(());
    }

    if containers.is_empty() {
        bail!("missing argument for \"rm\"\nRun 'toolbox --help' for usage.");
    }

    for container in containers {
        let info = podman.inspect_container(container)?;
        if !has_toolbox_labels(info.config.labels.as_ref()) {
            bail!("{container} is not a toolbox container");
        }
        remove(podman, container, force)?;
    }
    Ok(())
}

/// Ids of every toolbox container, across both label generations.
#[context("Listing toolbox containers")]
fn all_toolbox_container_ids(podman: &Podman) -> Result<BTreeSet<String>> {
    let mut entries = Vec::new();
    for filter in TOOLBOX_LABEL_FILTERS {
        entries.extend(podman.get_containers(&["--all", "--filter", filter])?);
    }
    Ok(dedupe_ids(entries))
}

fn dedupe_ids(entries: Vec<PsEntry>) -> BTreeSet<String> {
    entries.into_iter().map(|entry| entry.id).collect()
}

/// Whether a container's labels mark it as a toolbox container.
fn has_toolbox_labels(labels: Option<&HashMap<String, String>>) -> bool {
    let Some(labels) = labels else {
        return false;
    };
    labels.get("com.redhat.component").map(String::as_str) == Some("fedora-toolbox")
        || labels.get("com.github.debarshiray.toolbox").map(String::as_str) == Some("true")
}

fn remove(podman: &Podman, container: &str, force: bool) -> Result<()> {
    tracing::debug!("Removing container {container}");
    if let Err(err) = podman.rm(container, force) {
        return match err.downcast_ref::<EngineError>() {
            Some(EngineError::Busy) => bail!("container {container} is running"),
            Some(EngineError::NonExistent) => bail!("container {container} does not exist"),
            _ => Err(err).with_context(|| format!("failed to remove container {container}")),
        };
    }
    Ok(())
}
