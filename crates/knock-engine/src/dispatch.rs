//! Operator-configured actions fired on grant open and grant expiry.
//!
//! Templates come from the configuration file and are trusted input. The
//! single `%s` placeholder is replaced with the client's dotted-quad source
//! address — a rendered `Ipv4Addr` cannot carry shell metacharacters, so no
//! escaping is performed.

use std::net::Ipv4Addr;
use std::process::Command;

use anyhow::{ensure, Context, Result};

/// Substitute the client address into an action template.
pub fn render_action(template: &str, client: Ipv4Addr) -> String {
    template.replacen("%s", &client.to_string(), 1)
}

/// Seam between the knock engine and the outside world. Production uses
/// [`ShellRunner`]; tests substitute a recorder.
pub trait ActionRunner: Send + Sync {
    fn run(&self, template: &str, client: Ipv4Addr) -> Result<()>;
}

/// Runs rendered templates under `sh -c`, blocking until they exit.
pub struct ShellRunner;

impl ActionRunner for ShellRunner {
    fn run(&self, template: &str, client: Ipv4Addr) -> Result<()> {
        let rendered = render_action(template, client);
        let status = Command::new("sh")
            .arg("-c")
            .arg(&rendered)
            .status()
            .with_context(|| format!("failed to spawn action '{rendered}'"))?;
        ensure!(status.success(), "action '{rendered}' exited with {status}");
        Ok(())
    }
}
