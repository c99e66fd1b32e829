//! Container, image and release name resolution.
//!
//! Turns the (optional) user-supplied container name, image name and
//! release into a fully resolved identity, using the host's os-release
//! metadata for defaults.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use fn_error_context::context;
use regex::Regex;
use thiserror::Error;

/// Pattern every container name must match.
pub(crate) const CONTAINER_NAME_PATTERN: &str = "[a-zA-Z0-9][a-zA-Z0-9_.-]*";

/// Name of the default container for the host release.
pub(crate) const CONTAINER_NAME_DEFAULT: &str = "fedora-toolbox";

/// Prefix of default container names for non-default releases.
const CONTAINER_NAME_PREFIX_DEFAULT: &str = "fedora-toolbox";

/// Base name of the default image, tagged with the release.
const IMAGE_BASE_NAME: &str = "fedora-toolbox";

/// A user-supplied container name that fails [`CONTAINER_NAME_PATTERN`].
#[derive(Debug, Error)]
#[error(
    "invalid container name '{name}'\nContainer names must match '{CONTAINER_NAME_PATTERN}'\nRun 'toolbox --help' for usage."
)]
pub(crate) struct InvalidName {
    pub(crate) name: String,
}

/// Fully resolved identity of a toolbox container. Constructed once per
/// invocation and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContainerIdentity {
    pub(crate) container: String,
    pub(crate) image: String,
    pub(crate) release: String,
}

/// Check a container name against [`CONTAINER_NAME_PATTERN`].
pub(crate) fn validate_container_name(name: &str) -> Result<(), InvalidName> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(&format!("^{CONTAINER_NAME_PATTERN}$")).unwrap());
    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(InvalidName {
            name: name.to_owned(),
        })
    }
}

/// Resolve the (container, image, release) triple.
///
/// A missing release falls back to `host_release`; a missing container
/// name is synthesized from the resolved release (the bare default name
/// for the default release, a release-suffixed one otherwise); a
/// missing image becomes the default base image tagged with the
/// release. A supplied container name never changes the release.
pub(crate) fn resolve(
    container: Option<&str>,
    image: Option<&str>,
    release: Option<&str>,
    host_release: &str,
) -> Result<ContainerIdentity> {
    if let Some(name) = container {
        validate_container_name(name)?;
    }

    let release = release.unwrap_or(host_release);
    if release.is_empty() {
        bail!("failed to resolve the release");
    }

    let image = match image {
        Some(image) => image.to_owned(),
        None => format!("{IMAGE_BASE_NAME}:{release}"),
    };

    let container = match container {
        Some(container) => container.to_owned(),
        None if release == host_release => CONTAINER_NAME_DEFAULT.to_owned(),
        None => format!("{CONTAINER_NAME_PREFIX_DEFAULT}-{release}"),
    };

    Ok(ContainerIdentity {
        container,
        image,
        release: release.to_owned(),
    })
}

/// The command line to enter the given container, shown to the user
/// after creation.
pub(crate) fn enter_command(executable_base: &str, container: &str, release: &str) -> String {
    if container == CONTAINER_NAME_DEFAULT {
        format!("{executable_base} enter")
    } else if container == format!("{CONTAINER_NAME_PREFIX_DEFAULT}-{release}") {
        format!("{executable_base} enter --release {release}")
    } else {
        format!("{executable_base} enter --container {container}")
    }
}

/// `VERSION_ID` from the host's os-release metadata.
#[context("Reading os-release")]
pub(crate) fn host_version_id() -> Result<String> {
    for path in ["/etc/os-release", "/usr/lib/os-release"] {
        if Path::new(path).exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read {path}"))?;
            return version_id_from_os_release(&contents);
        }
    }
    bail!("failed to find an os-release file")
}

fn version_id_from_os_release(contents: &str) -> Result<String> {
    let fields = parse_os_release(contents);
    match fields.get("VERSION_ID") {
        Some(version) if !version.is_empty() => Ok(version.clone()),
        _ => bail!("failed to get the host version from os-release"),
    }
}

/// Parse os-release(5) key/value lines, stripping surrounding quotes.
fn parse_os_release(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            (key.to_owned(), value.to_owned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use similar_asserts::assert_eq;

    #[test]
    fn valid_names_are_accepted() {
        for name in ["fedora-toolbox", "f35", "my_box", "a.b-c", "0", "A-1.b_2"] {
            assert!(validate_container_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn invalid_names_are_rejected() {
        for name in ["", "-leading-dash", "has space", "has/slash", "einbähn", "a:b"] {
            assert!(validate_container_name(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn resolve_accepts_valid_names_unchanged() -> Result<()> {
        let identity = resolve(Some("my-box.2"), None, None, "35")?;
        assert_eq!(identity.container, "my-box.2");
        assert_eq!(identity.release, "35");
        Ok(())
    }

    #[test]
    fn resolve_rejects_invalid_names() {
        let err = resolve(Some("no spaces"), None, None, "35").unwrap_err();
        assert!(err.is::<InvalidName>());
    }

    #[test]
    fn resolve_defaults_to_host_release() -> Result<()> {
        let identity = resolve(None, None, None, "35")?;
        assert_eq!(
            identity,
            ContainerIdentity {
                container: "fedora-toolbox".to_owned(),
                image: "fedora-toolbox:35".to_owned(),
                release: "35".to_owned(),
            }
        );
        Ok(())
    }

    #[test]
    fn resolve_suffixes_name_for_explicit_release() -> Result<()> {
        let identity = resolve(None, None, Some("36"), "35")?;
        assert_eq!(
            identity,
            ContainerIdentity {
                container: "fedora-toolbox-36".to_owned(),
                image: "fedora-toolbox:36".to_owned(),
                release: "36".to_owned(),
            }
        );
        Ok(())
    }

    #[test]
    fn resolve_explicit_release_matching_host_is_default() -> Result<()> {
        let identity = resolve(None, None, Some("35"), "35")?;
        assert_eq!(identity.container, "fedora-toolbox");
        Ok(())
    }

    #[test]
    fn resolve_supplied_name_keeps_release() -> Result<()> {
        let identity = resolve(Some("scratch"), None, Some("36"), "35")?;
        assert_eq!(identity.container, "scratch");
        assert_eq!(identity.image, "fedora-toolbox:36");
        assert_eq!(identity.release, "36");
        Ok(())
    }

    #[test]
    fn resolve_supplied_image_is_untouched() -> Result<()> {
        let identity = resolve(None, Some("registry.example.com/devbox:1"), None, "35")?;
        assert_eq!(identity.image, "registry.example.com/devbox:1");
        Ok(())
    }

    #[test]
    fn resolve_fails_without_any_release() {
        assert!(resolve(None, None, None, "").is_err());
    }

    #[test]
    fn enter_command_varies_with_name() {
        assert_eq!(enter_command("toolbox", "fedora-toolbox", "35"), "toolbox enter");
        assert_eq!(
            enter_command("toolbox", "fedora-toolbox-36", "36"),
            "toolbox enter --release 36"
        );
        assert_eq!(
            enter_command("toolbox", "my-box", "35"),
            "toolbox enter --container my-box"
        );
    }

    #[test]
    fn os_release_version_id_is_parsed() -> Result<()> {
        let contents = indoc! {r#"
            NAME="Fedora Linux"
            VERSION="35 (Workstation Edition)"
            ID=fedora
            VERSION_ID=35
            # a comment
            VARIANT_ID=workstation
        "#};
        assert_eq!(version_id_from_os_release(contents)?, "35");
        Ok(())
    }

    #[test]
    fn os_release_quoted_version_id_is_unquoted() -> Result<()> {
        assert_eq!(version_id_from_os_release("VERSION_ID=\"35\"\n")?, "35");
        Ok(())
    }

    #[test]
    fn os_release_without_version_id_fails() {
        assert!(version_id_from_os_release("ID=fedora\n").is_err());
    }
}
