//! Creation of new toolbox containers.

use anyhow::{Context, Result, bail};
use fn_error_context::context;

use crate::context::HostContext;
use crate::image;
use crate::mounts::{self, MountTopology};
use crate::names::{self, ContainerIdentity};
use crate::podman::Podman;
use crate::utils::{Spinner, group_for_sudo};

/// Create the container described by `identity`, acquiring its image
/// first if needed.
#[context("Creating container {}", identity.container)]
pub(crate) fn create(
    podman: &Podman,
    ctx: &HostContext,
    identity: &ContainerIdentity,
    assume_yes: bool,
) -> Result<()> {
    assert!(!identity.container.is_empty());
    assert!(!identity.image.is_empty());
    assert!(!identity.release.is_empty());

    let enter = names::enter_command(&ctx.executable_base, &identity.container, &identity.release);
    if podman.container_exists(&identity.container)? {
        bail!(
            "container {} already exists\nEnter with: {enter}\nRun 'toolbox --help' for usage.",
            identity.container
        );
    }

    let pulled = image::ensure_image(podman, &identity.image, &identity.release, assume_yes)?;
    if pulled {
        tracing::debug!("Pulled image {}", identity.image);
    }
    let image_full = image::fully_qualified_reference(podman, &identity.image)?;

    let sudo_group = group_for_sudo()?;
    tracing::debug!("Group for sudo is {sudo_group}");

    // Only newer podman accepts the host ulimit shorthand.
    let ulimit_host = podman.check_version("1.5.0");

    let inputs = mounts::probe(ctx)?;
    let topology = mounts::assemble(&inputs);

    let args = assemble_create_args(
        &identity.container,
        &image_full,
        ctx,
        &sudo_group,
        ulimit_host,
        &topology,
    );
    if let Ok(joined) = shlex::try_join(args.iter().map(String::as_str)) {
        tracing::debug!("podman {joined}");
    }

    let spinner = Spinner::new(format!("Creating container {}: ", identity.container));
    let result = podman.create(&args);
    drop(spinner);
    result.with_context(|| format!("failed to create container {}", identity.container))?;

    println!("Created container: {}", identity.container);
    println!("Enter with: {enter}");
    Ok(())
}

/// The full `podman create` argument list, including the in-container
/// init entry point.
fn assemble_create_args(
    container: &str,
    image_full: &str,
    ctx: &HostContext,
    sudo_group: &str,
    ulimit_host: bool,
    topology: &MountTopology,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "create",
        "--dns",
        "none",
        "--env",
        &format!("TOOLBOX_PATH={}", ctx.toolbox_path),
        "--group-add",
        sudo_group,
        "--hostname",
        "toolbox",
        "--ipc",
        "host",
        "--label",
        "com.github.containers.toolbox=true",
        "--label",
        "com.github.debarshiray.toolbox=true",
        "--name",
        container,
        "--network",
        "host",
        "--no-hosts",
        "--pid",
        "host",
        "--privileged",
        "--security-opt",
        "label=disable",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();

    if ulimit_host {
        args.push("--ulimit".to_owned());
        args.push("host".to_owned());
    }

    args.push("--userns=keep-id".to_owned());
    args.push("--user".to_owned());
    args.push("root:root".to_owned());

    for volume in &topology.volumes {
        args.push("--volume".to_owned());
        args.push(volume.clone());
    }

    args.push(image_full.to_owned());

    args.extend(
        ["toolbox", "--log-level", "debug", "init-container", "--home"]
            .iter()
            .map(ToString::to_string),
    );
    args.push(ctx.home.to_string());
    if topology.home_link {
        args.push("--home-link".to_owned());
    }
    if topology.media_link {
        args.push("--media-link".to_owned());
    }
    if topology.mnt_link {
        args.push("--mnt-link".to_owned());
    }
    args.push("--monitor-host".to_owned());
    args.push("--shell".to_owned());
    args.push(ctx.shell.clone());
    args.push("--uid".to_owned());
    args.push(ctx.uid.to_string());
    args.push("--user".to_owned());
    args.push(ctx.username.clone());

    args
}
