//! # Toolbox
//!
//! A command-line front-end for unprivileged development containers on
//! top of Podman. A toolbox container transparently shares the host's
//! home directory, display, D-Bus instances and removable media with
//! the invoking user, so it feels like a regular shell on the host
//! while keeping the development environment containerized.
//!
//! The `toolbox` binary (`crates/cli`) is a thin wrapper that delegates
//! to [`cli::run_from_iter`].
//!
//! # Module Index
//!
//! - [`cli`] - Command-line interface and dispatch (clap-based)
//! - `context` - Host/container/sandbox execution-context detection
//! - `names` - Container, image and release name resolution
//! - `podman` - Gateway to the Podman container engine
//! - `mounts` - Bind-mount topology for new containers
//! - `image` - Base-image acquisition
//! - `create` - Container provisioning
//! - `rm` - Container removal
//! - `sdbus` - Service-bus queries through busctl(1)
//!
//! The API is internal and not stable for external consumption.

pub mod cli;
mod context;
mod create;
mod image;
mod mounts;
mod names;
mod podman;
mod rm;
mod sdbus;
mod utils;
