//! Small host-interaction helpers shared across commands.

use std::io::{self, BufRead, Write};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use indicatif::ProgressBar;

/// Ask a yes/no question on the terminal. An empty answer means no;
/// anything other than the recognized forms re-prompts.
pub(crate) fn ask_for_confirmation(prompt: &str) -> Result<bool> {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("{prompt} ");
        io::stdout().flush().context("failed to flush stdout")?;

        line.clear();
        stdin
            .lock()
            .read_line(&mut line)
            .context("failed to read from stdin")?;

        match parse_confirmation(&line) {
            Some(answer) => return Ok(answer),
            None => continue,
        }
    }
}

fn parse_confirmation(line: &str) -> Option<bool> {
    match line.trim().to_lowercase().as_str() {
        "" | "n" | "no" => Some(false),
        "y" | "yes" => Some(true),
        _ => None,
    }
}

/// Name of the group that grants sudo(8) access on this host. Fedora
/// and Debian derivatives disagree on the spelling.
pub(crate) fn group_for_sudo() -> Result<String> {
    for name in ["sudo", "wheel"] {
        if uzers::get_group_by_name(name).is_some() {
            return Ok(name.to_owned());
        }
    }
    bail!("group for sudo not found")
}

/// Replace this process with man(1) showing the given manual page.
/// Only returns on failure.
pub(crate) fn show_manual(manual: &str) -> Result<()> {
    let err = Command::new("man").arg(manual).exec();
    if err.kind() == io::ErrorKind::NotFound {
        bail!("man(1) not found");
    }
    Err(err).context("failed to invoke man(1)")
}

/// A terminal spinner that clears itself when dropped, so long-running
/// engine operations never leave a stale line behind.
#[derive(Debug)]
pub(crate) struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    pub(crate) fn new(message: String) -> Self {
        let bar = ProgressBar::new_spinner().with_message(message);
        bar.enable_steady_tick(Duration::from_millis(500));
        Spinner { bar }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_defaults_to_no() {
        assert_eq!(parse_confirmation(""), Some(false));
        assert_eq!(parse_confirmation("\n"), Some(false));
    }

    #[test]
    fn confirmation_recognized_forms() {
        assert_eq!(parse_confirmation("y\n"), Some(true));
        assert_eq!(parse_confirmation("Yes\n"), Some(true));
        assert_eq!(parse_confirmation("n\n"), Some(false));
        assert_eq!(parse_confirmation("NO\n"), Some(false));
    }

    #[test]
    fn confirmation_reprompts_on_garbage() {
        assert_eq!(parse_confirmation("maybe\n"), None);
        assert_eq!(parse_confirmation("yess\n"), None);
    }

    #[test]
    fn spinner_can_be_created_and_dropped() {
        let spinner = Spinner::new("working: ".to_owned());
        drop(spinner);
    }
}
