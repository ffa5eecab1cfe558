//! Command-line interface for the `metamcp` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mm_domain::error::{Error, Result};
use mm_domain::policy::PolicyDocument;

#[derive(Parser)]
#[command(name = "metamcp", about = "Role-aware tool broker", version)]
pub struct Cli {
    /// Path to the policy document.
    #[arg(long, global = true, default_value = "policy.yaml")]
    pub policy: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the broker (default).
    Serve,
    /// Policy inspection commands.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version and exit.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the policy document and report every issue.
    Validate,
}

/// Read and parse the policy document from disk.
pub fn load_policy(path: &PathBuf) -> Result<PolicyDocument> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::PolicyInvalid(format!("cannot read {}: {e}", path.display()))
    })?;
    PolicyDocument::from_yaml(&raw)
}

/// Validate and print issues; returns whether the document is usable.
pub fn validate(doc: &PolicyDocument, path: &PathBuf) -> bool {
    let issues = doc.validate();
    if issues.is_empty() {
        println!("{}: ok", path.display());
        return true;
    }
    for issue in &issues {
        println!("{issue}");
    }
    !issues
        .iter()
        .any(|i| i.severity == mm_domain::policy::IssueSeverity::Error)
}
