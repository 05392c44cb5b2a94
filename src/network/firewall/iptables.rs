//! `iptables` command-line backend.

use crate::network::firewall::{FirewallError, RuleInstaller, RuleRecord, RuleRemoval, RuleSpec};
use log::{debug, info};
use std::io::Write;
use std::process::{Command, Output, Stdio};

/// Tables flushed when the diverter is configured to start from a clean slate.
const FLUSH_TABLES: [&str; 4] = ["filter", "nat", "mangle", "raw"];

/// Rule operations understood by `iptables`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Insert,
    Check,
    Delete,
}

impl Operation {
    fn flag(&self) -> &'static str {
        match self {
            Operation::Insert => "-I",
            Operation::Check => "-C",
            Operation::Delete => "-D",
        }
    }
}

/// Full argument list for one rule operation.
fn rule_args(operation: Operation, spec: &RuleSpec) -> Vec<String> {
    let mut args = vec![
        "-t".to_string(),
        spec.table.clone(),
        operation.flag().to_string(),
        spec.chain.clone(),
    ];
    args.extend(spec.args.iter().cloned());
    args
}

/// Installs rules by invoking the `iptables` family of binaries.
#[derive(Debug, Clone)]
pub struct Iptables {
    binary: String,
    save_binary: String,
    restore_binary: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
            save_binary: "iptables-save".to_string(),
            restore_binary: "iptables-restore".to_string(),
        }
    }
}

impl Iptables {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, binary: &str, args: &[String]) -> Result<Output, FirewallError> {
        debug!("Running {} {}", binary, args.join(" "));
        Command::new(binary)
            .args(args)
            .output()
            .map_err(|source| FirewallError::Spawn {
                command: binary.to_string(),
                source,
            })
    }

    fn run_checked(&self, binary: &str, args: &[String]) -> Result<Output, FirewallError> {
        let output = self.run(binary, args)?;
        if !output.status.success() {
            return Err(FirewallError::Failed {
                command: format!("{} {}", binary, args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Returns the current rule set in `iptables-save` format.
    pub fn save(&self) -> Result<String, FirewallError> {
        let output = self.run_checked(&self.save_binary, &[])?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Replaces the current rule set with a snapshot taken by [`save`](Self::save).
    pub fn restore(&self, snapshot: &str) -> Result<(), FirewallError> {
        let spawn_error = |source| FirewallError::Spawn {
            command: self.restore_binary.clone(),
            source,
        };

        let mut child = Command::new(&self.restore_binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(snapshot.as_bytes()).map_err(spawn_error)?;
        }

        let output = child.wait_with_output().map_err(spawn_error)?;
        if !output.status.success() {
            return Err(FirewallError::Failed {
                command: self.restore_binary.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("Restored saved iptables rules");
        Ok(())
    }

    /// Flushes every chain of the standard tables.
    pub fn flush(&self) -> Result<(), FirewallError> {
        for table in FLUSH_TABLES {
            self.run_checked(&self.binary, &["-t".to_string(), table.to_string(), "-F".to_string()])?;
        }
        info!("Flushed iptables tables: {}", FLUSH_TABLES.join(", "));
        Ok(())
    }
}

impl RuleInstaller for Iptables {
    fn install(&self, spec: &RuleSpec) -> Result<RuleRecord, FirewallError> {
        self.run_checked(&self.binary, &rule_args(Operation::Insert, spec))?;
        debug!("Installed rule {}", spec);
        Ok(RuleRecord::new(spec.clone()))
    }

    fn remove(&self, rule: &RuleRecord) -> Result<RuleRemoval, FirewallError> {
        let check = self.run(&self.binary, &rule_args(Operation::Check, rule.spec()))?;
        if !check.status.success() {
            return Ok(RuleRemoval::AlreadyAbsent);
        }

        self.run_checked(&self.binary, &rule_args(Operation::Delete, rule.spec()))?;
        Ok(RuleRemoval::Removed)
    }
}
