// Shared utilities for Linux iptables operations

use std::fmt;
use std::process::Command;
use thiserror::Error;

/// Errors raised while running packet-filter commands
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("failed to execute iptables: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("iptables {args} failed ({status}): {stderr}")]
    Command {
        args: String,
        status: String,
        stderr: String,
    },
}

impl FilterError {
    /// True when the kernel refused to create a chain that is already there
    pub fn is_chain_exists(&self) -> bool {
        match self {
            FilterError::Command { stderr, .. } => stderr.contains("already exists"),
            FilterError::Spawn(_) => false,
        }
    }
}

/// Packet-filter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule action, mirrors the iptables command flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Append,
    Insert,
    Delete,
}

impl Action {
    pub fn flag(&self) -> &'static str {
        match self {
            Action::Append => "-A",
            Action::Insert => "-I",
            Action::Delete => "-D",
        }
    }

    /// Append becomes Insert for rules that must precede the default policy
    pub fn to_insert(self) -> Action {
        match self {
            Action::Append => Action::Insert,
            other => other,
        }
    }
}

/// Something that can execute raw iptables argument vectors
pub trait PacketFilter: Send + Sync {
    /// Run one command, returning stdout on success
    fn raw(&self, args: &[String]) -> Result<String, FilterError>;
}

/// The real thing: shells out to `iptables --wait`
pub struct IptablesCommand {
    binary: String,
}

impl IptablesCommand {
    pub fn new() -> Self {
        Self {
            binary: "iptables".to_string(),
        }
    }

    /// Check if iptables is available
    pub fn is_available(&self) -> bool {
        Command::new(&self.binary).arg("--version").output().is_ok()
    }
}

impl PacketFilter for IptablesCommand {
    fn raw(&self, args: &[String]) -> Result<String, FilterError> {
        log::trace!("{} --wait {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary).arg("--wait").args(args).output()?;

        if !output.status.success() {
            return Err(FilterError::Command {
                args: args.join(" "),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Does the rule already exist in `chain`?
pub fn rule_exists(filter: &dyn PacketFilter, table: Table, chain: &str, rule: &[String]) -> bool {
    let mut args = vec![
        "-t".to_string(),
        table.to_string(),
        "-C".to_string(),
        chain.to_string(),
    ];
    args.extend_from_slice(rule);
    filter.raw(&args).is_ok()
}

/// Add or delete a rule, skipping the kernel call when it would be a no-op
pub fn program_rule(
    filter: &dyn PacketFilter,
    table: Table,
    action: Action,
    chain: &str,
    rule: &[String],
) -> Result<(), FilterError> {
    let present = rule_exists(filter, table, chain, rule);

    match action {
        Action::Append | Action::Insert if present => {
            log::debug!(
                "Rule already present in {}/{}: {}",
                table,
                chain,
                rule.join(" ")
            );
            return Ok(());
        }
        Action::Delete if !present => {
            log::debug!(
                "Rule not present in {}/{}, nothing to delete: {}",
                table,
                chain,
                rule.join(" ")
            );
            return Ok(());
        }
        _ => {}
    }

    let mut args = vec![
        "-t".to_string(),
        table.to_string(),
        action.flag().to_string(),
        chain.to_string(),
    ];
    args.extend_from_slice(rule);
    filter.raw(&args)?;
    Ok(())
}

/// Create a chain, treating "already exists" as success
///
/// Returns true when the chain was freshly created.
pub fn ensure_chain(filter: &dyn PacketFilter, table: Table, chain: &str) -> Result<bool, FilterError> {
    let args = vec![
        "-t".to_string(),
        table.to_string(),
        "-N".to_string(),
        chain.to_string(),
    ];

    match filter.raw(&args) {
        Ok(_) => {
            log::info!("Created chain {} in table {}", chain, table);
            Ok(true)
        }
        Err(e) if e.is_chain_exists() => {
            log::debug!("Chain {} already exists in table {}", chain, table);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Drop every rule of a chain, keeping the chain and the jumps into it
pub fn flush_chain(filter: &dyn PacketFilter, table: Table, chain: &str) -> Result<(), FilterError> {
    let args = vec![
        "-t".to_string(),
        table.to_string(),
        "-F".to_string(),
        chain.to_string(),
    ];
    filter.raw(&args)?;
    log::info!("Flushed chain {} in table {}", chain, table);
    Ok(())
}

/// Flush and delete a chain. Both steps are attempted.
pub fn remove_chain(filter: &dyn PacketFilter, table: Table, chain: &str) -> Result<(), FilterError> {
    let mut first_error = None;

    for flag in ["-F", "-X"] {
        let args = vec![
            "-t".to_string(),
            table.to_string(),
            flag.to_string(),
            chain.to_string(),
        ];
        if let Err(e) = filter.raw(&args) {
            log::warn!("Failed to {} chain {} in table {}: {}", flag, chain, table, e);
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            log::info!("Removed chain {} from table {}", chain, table);
            Ok(())
        }
    }
}

/// Build an argument vector from string slices
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
