//! The toolbox command line.
//!
//! Parsing is plain clap derive, but help is not: every `--help`
//! dispatches to man(1) instead of clap's generated text, so the
//! built-in help machinery is disabled throughout. Inside a toolbox
//! container the whole command line is forwarded back to the host
//! before any command logic runs.

use std::ffi::OsString;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::context::{self, HostContext};
use crate::create;
use crate::names;
use crate::podman::Podman;
use crate::rm;
use crate::utils::show_manual;

/// Logging verbosity, passed through to podman as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Panic,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
            LogLevel::Panic => "panic",
        }
    }
}

/// Tool for containerized command line environments on Linux
#[derive(Debug, Parser)]
#[command(name = "toolbox", disable_help_flag = true, disable_help_subcommand = true)]
pub struct Cli {
    /// Automatically answer yes for all questions
    #[arg(short = 'y', long = "assumeyes", global = true)]
    assume_yes: bool,

    /// Log level for the program
    #[arg(long, value_enum, default_value_t = LogLevel::Error, global = true)]
    log_level: LogLevel,

    /// Show the log output of podman
    #[arg(long, global = true)]
    log_podman: bool,

    /// Same as '--log-level debug'
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Show the manual page
    #[arg(short = 'h', long = "help", global = true)]
    help: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a new toolbox container
    #[command(disable_help_flag = true)]
    Create(CreateOptions),

    /// Enter an existing toolbox container
    #[command(disable_help_flag = true)]
    Enter,

    /// Remove existing toolbox containers and images
    #[command(disable_help_flag = true)]
    Reset,

    /// Remove one or more toolbox containers
    #[command(disable_help_flag = true)]
    Rm(RmOptions),

    /// Run a command in an existing toolbox container
    #[command(disable_help_flag = true)]
    Run,
}

impl Commands {
    fn manual(&self) -> &'static str {
        match self {
            Commands::Create(_) => "toolbox-create",
            Commands::Enter => "toolbox-enter",
            Commands::Reset => "toolbox-reset",
            Commands::Rm(_) => "toolbox-rm",
            Commands::Run => "toolbox-run",
        }
    }
}

#[derive(Debug, Args)]
struct CreateOptions {
    /// Assign a different name to the toolbox container
    #[arg(short, long)]
    container: Option<String>,

    /// Change the name of the base image used to create the toolbox container
    #[arg(short, long)]
    image: Option<String>,

    /// Create a toolbox container for a different operating system release than the host
    #[arg(short, long)]
    release: Option<u32>,

    /// Name of the toolbox container
    name: Option<String>,
}

#[derive(Debug, Args)]
struct RmOptions {
    /// Remove all toolbox containers
    #[arg(short, long)]
    all: bool,

    /// Force the removal of running and paused toolbox containers
    #[arg(short, long)]
    force: bool,

    /// Names of the toolbox containers
    containers: Vec<String>,
}

/// Parse the given command line and run it to completion.
pub fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    let log_level = if cli.verbose {
        "debug"
    } else {
        cli.log_level.as_str()
    };
    // tracing has no fatal/panic levels; podman does.
    let tracing_level = match log_level {
        "fatal" | "panic" => "error",
        other => other,
    };
    toolbox_utils::initialize_tracing(tracing_level);

    let ctx = HostContext::detect()?;
    tracing::debug!("Running as user {} ({})", ctx.username, ctx.uid);
    tracing::debug!("Resolved executable path {}", ctx.executable);
    tracing::debug!("Running inside working directory {}", ctx.working_directory);
    if let Some(version) = ctx.cgroups_version {
        tracing::debug!("Running on a cgroups v{version} host");
    }

    // Nothing is handled locally inside a container, help included;
    // the whole command line goes back to the host first.
    if must_forward(&ctx)? {
        let code = context::forward_to_host(&ctx)?;
        std::process::exit(code);
    }

    let Some(command) = cli.command else {
        if cli.help {
            return show_manual("toolbox");
        }
        print_missing_command(&ctx.executable_base);
        return Ok(());
    };

    if cli.help {
        return show_manual(command.manual());
    }

    let log_podman = cli.log_podman || matches!(log_level, "debug" | "trace");
    let podman = Podman::new(log_level, log_podman);

    match command {
        Commands::Create(options) => {
            let supplied =
                supplied_container(options.container.as_deref(), options.name.as_deref());
            if let Some((name, source)) = supplied {
                if names::validate_container_name(name).is_err() {
                    bail!(
                        "invalid argument for '{source}'\nContainer names must match '{}'\nRun 'toolbox --help' for usage.",
                        names::CONTAINER_NAME_PATTERN
                    );
                }
            }
            let container = supplied.map(|(name, _)| name);
            let release = options.release.map(|release| release.to_string());
            let host_release = names::host_version_id()?;
            let identity = names::resolve(
                container,
                options.image.as_deref(),
                release.as_deref(),
                &host_release,
            )?;
            create::create(&podman, &ctx, &identity, cli.assume_yes)
        }
        Commands::Rm(options) => rm::rm(&podman, &options.containers, options.all, options.force),
        // Surface-only commands; their manuals describe them.
        Commands::Enter | Commands::Reset | Commands::Run => Ok(()),
    }
}

/// Whether this invocation must be handed back to the host before any
/// local handling. Fails for containers this tool did not create.
fn must_forward(ctx: &HostContext) -> Result<bool> {
    if !ctx.in_container {
        return Ok(false);
    }
    if !ctx.in_toolbox_container {
        bail!("this is not a toolbox container");
    }
    Ok(true)
}

/// The container name in effect and the argument it came from, for
/// error attribution. A positional name wins over the flag.
fn supplied_container<'a>(
    flag: Option<&'a str>,
    positional: Option<&'a str>,
) -> Option<(&'a str, &'static str)> {
    match (flag, positional) {
        (_, Some(name)) => Some((name, "CONTAINER")),
        (Some(name), None) => Some((name, "--container")),
        (None, None) => None,
    }
}

fn print_missing_command(executable_base: &str) {
    eprintln!("missing command");
    eprintln!();
    eprintln!("create    Create a new toolbox container");
    eprintln!("enter     Enter an existing toolbox container");
    eprintln!("run       Run a command in an existing toolbox container");
    eprintln!();
    eprintln!("Run '{executable_base} --help' for usage.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn create_flags_are_parsed() {
        let cli = Cli::try_parse_from(["toolbox", "create", "-c", "dev", "-i", "img", "-r", "36"])
            .unwrap();
        let Some(Commands::Create(options)) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(options.container.as_deref(), Some("dev"));
        assert_eq!(options.image.as_deref(), Some("img"));
        assert_eq!(options.release, Some(36));
        assert_eq!(options.name, None);
    }

    #[test]
    fn create_accepts_a_positional_name() {
        let cli = Cli::try_parse_from(["toolbox", "create", "dev"]).unwrap();
        let Some(Commands::Create(options)) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(options.name.as_deref(), Some("dev"));
    }

    #[test]
    fn create_rejects_a_non_numeric_release() {
        assert!(Cli::try_parse_from(["toolbox", "create", "-r", "rawhide"]).is_err());
    }

    #[test]
    fn rm_flags_are_parsed() {
        let cli = Cli::try_parse_from(["toolbox", "rm", "-a", "-f"]).unwrap();
        let Some(Commands::Rm(options)) = cli.command else {
            panic!("expected rm");
        };
        assert!(options.all);
        assert!(options.force);
        assert!(options.containers.is_empty());
    }

    #[test]
    fn help_is_global_and_does_not_expand_to_clap_help() {
        let cli = Cli::try_parse_from(["toolbox", "create", "--help"]).unwrap();
        assert!(cli.help);
        assert!(matches!(cli.command, Some(Commands::Create(_))));

        let cli = Cli::try_parse_from(["toolbox", "-h"]).unwrap();
        assert!(cli.help);
        assert!(cli.command.is_none());
    }

    #[test]
    fn verbose_and_assumeyes_are_global() {
        let cli = Cli::try_parse_from(["toolbox", "create", "--verbose", "-y"]).unwrap();
        assert!(cli.verbose);
        assert!(cli.assume_yes);
    }

    #[test]
    fn positional_name_wins_attribution() {
        assert_eq!(
            supplied_container(Some("flag"), Some("positional")),
            Some(("positional", "CONTAINER"))
        );
        assert_eq!(supplied_container(Some("flag"), None), Some(("flag", "--container")));
        assert_eq!(supplied_container(None, None), None);
    }

    fn context_in(in_container: bool, in_toolbox_container: bool) -> HostContext {
        HostContext {
            in_container,
            in_toolbox_container,
            cgroups_version: None,
            uid: 1000,
            username: "user".to_owned(),
            home: "/home/user".into(),
            shell: "/bin/bash".to_owned(),
            executable: "/usr/bin/toolbox".into(),
            executable_base: "toolbox".to_owned(),
            working_directory: "/home/user".into(),
            toolbox_path: "/usr/bin/toolbox".into(),
        }
    }

    #[test]
    fn host_invocations_are_not_forwarded() {
        assert!(!must_forward(&context_in(false, false)).unwrap());
    }

    #[test]
    fn toolbox_containers_forward_everything() {
        assert!(must_forward(&context_in(true, true)).unwrap());
    }

    #[test]
    fn foreign_containers_fail_instead_of_forwarding() {
        let err = must_forward(&context_in(true, false)).unwrap_err();
        assert_eq!(err.to_string(), "this is not a toolbox container");
    }

    #[test]
    fn log_level_values() {
        let cli = Cli::try_parse_from(["toolbox", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level.as_str(), "debug");
        assert!(Cli::try_parse_from(["toolbox", "--log-level", "loud"]).is_err());
    }
}
