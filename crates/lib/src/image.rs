//! Image reference resolution and acquisition.
//!
//! A user-supplied image reference may be an image id, a short name
//! known to local storage, or a fully qualified registry reference.
//! [`ensure_image`] walks the candidates in a fixed order and only
//! falls back to pulling from the network, with the user's consent,
//! when nothing matches locally.

use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow, bail};
use fn_error_context::context;
use regex::Regex;
use thiserror::Error;

use crate::podman::Podman;
use crate::utils::{Spinner, ask_for_confirmation};

/// Registry that hosts the default toolbox images.
const REGISTRY_DEFAULT: &str = "registry.fedoraproject.org";

/// The user declined a download prompt.
#[derive(Debug, Error)]
#[error("cancelled by user")]
pub(crate) struct CancelledByUser;

/// Whether a reference could name an image by id: an unambiguous
/// prefix of a hex digest.
fn reference_can_be_id(image: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new("^[a-f0-9]{6,64}$").unwrap());
    pattern.is_match(image)
}

/// Whether a reference carries an explicit registry domain. The first
/// path component is a domain when it contains a dot or a port, or is
/// the literal `localhost`.
fn reference_has_domain(image: &str) -> bool {
    let Some((prefix, _)) = image.split_once('/') else {
        return false;
    };
    prefix.contains(['.', ':']) || prefix == "localhost"
}

fn reference_domain(image: &str) -> Option<&str> {
    image
        .split_once('/')
        .map(|(prefix, _)| prefix)
        .filter(|prefix| prefix.contains(['.', ':']) || *prefix == "localhost")
}

/// The candidate references to look up in local storage, in order. The
/// last entry is always the fully qualified reference used for
/// pulling.
fn resolution_candidates(image: &str, release: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    if reference_can_be_id(image) {
        candidates.push(image.to_owned());
    }
    if reference_has_domain(image) {
        candidates.push(image.to_owned());
    } else {
        candidates.push(format!("localhost/{image}"));
        candidates.push(format!("{REGISTRY_DEFAULT}/f{release}/{image}"));
    }
    candidates
}

/// Make sure `image` is available in local storage, pulling it after
/// prompting if necessary. Returns whether a pull happened.
#[context("Ensuring image {}", image)]
pub(crate) fn ensure_image(
    podman: &Podman,
    image: &str,
    release: &str,
    assume_yes: bool,
) -> Result<bool> {
    let candidates = resolution_candidates(image, release);
    for candidate in &candidates {
        tracing::debug!("Looking for image {candidate}");
        if podman.image_exists(candidate)? {
            return Ok(false);
        }
    }

    // The last candidate is fully qualified by construction.
    let full = candidates.last().unwrap_or_else(|| unreachable!());
    let Some(domain) = reference_domain(full) else {
        unreachable!("pull candidate {full} has no domain");
    };

    if !assume_yes && domain != "localhost" {
        println!("Image required to create toolbox container.");
        let prompt = format!("Download {full} (500MB)? [y/N]:");
        if !ask_for_confirmation(&prompt)? {
            return Err(CancelledByUser.into());
        }
    }

    tracing::debug!("Pulling image {full}");
    let spinner = Spinner::new(format!("Pulling {full}: "));
    let result = podman.pull(full);
    drop(spinner);
    result.with_context(|| format!("failed to pull image {full}"))?;
    Ok(true)
}

/// The fully qualified name of a locally present image. A reference
/// that already carries a registry domain is used as-is; anything else
/// is resolved through its first repository tag.
#[context("Resolving the fully qualified name of image {}", image)]
pub(crate) fn fully_qualified_reference(podman: &Podman, image: &str) -> Result<String> {
    if reference_has_domain(image) {
        return Ok(image.to_owned());
    }

    let info = podman.inspect_image(image)?;
    let tags = info
        .repo_tags
        .ok_or_else(|| anyhow!("image {image} has no repository tags"))?;
    match tags.first() {
        Some(tag) if !tag.is_empty() => Ok(tag.clone()),
        _ => bail!("image {image} has no repository tags"),
    }
}
