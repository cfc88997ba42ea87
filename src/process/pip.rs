//! Package installation into a runtime's private site directory via `pip --target`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::runtime::RuntimeError;

/// Lines of pip output kept when reporting a failure.
const FAILURE_TAIL_LINES: usize = 12;

#[derive(Debug)]
pub struct PipInstaller {
    interpreter: PathBuf,
    target: PathBuf,
    index_url: Option<String>,
    no_index: bool,
    installed: HashSet<String>,
}

impl PipInstaller {
    pub fn new(
        interpreter: PathBuf,
        target: PathBuf,
        index_url: Option<String>,
        no_index: bool,
    ) -> Self {
        Self {
            interpreter,
            target,
            index_url,
            no_index,
            installed: HashSet::new(),
        }
    }

    /// Requested packages not yet installed by this installer, order kept.
    pub fn pending<'a>(&self, packages: &'a [String]) -> Vec<&'a str> {
        let mut seen = HashSet::new();
        packages
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .filter(|p| {
                let key = normalize(p);
                !self.installed.contains(&key) && seen.insert(key)
            })
            .collect()
    }

    pub async fn install(&mut self, packages: &[String]) -> Result<(), RuntimeError> {
        reject_options(packages)?;
        let pending = self.pending(packages);
        if pending.is_empty() {
            debug!(?packages, "packages already installed");
            return Ok(());
        }

        info!(packages = ?pending, target = %self.target.display(), "installing packages");
        let output = self
            .command(&pending)
            .output()
            .await
            .map_err(|e| RuntimeError::Install {
                packages: owned(&pending),
                detail: format!("could not run pip: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                tail(&stdout)
            } else {
                tail(&stderr)
            };
            return Err(RuntimeError::Install {
                packages: owned(&pending),
                detail,
            });
        }

        for p in pending {
            self.installed.insert(normalize(p));
        }
        Ok(())
    }

    fn command(&self, packages: &[&str]) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(["-m", "pip", "install", "--disable-pip-version-check", "--no-input"])
            .arg("--target")
            .arg(&self.target);
        if self.no_index {
            cmd.arg("--no-index");
        } else if let Some(url) = &self.index_url {
            cmd.arg("--index-url").arg(url);
        }
        cmd.args(packages)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Names reach pip as arguments; anything that looks like an option could
/// override the configured package sources or install target.
fn reject_options(packages: &[String]) -> Result<(), RuntimeError> {
    let options: Vec<String> = packages
        .iter()
        .map(|p| p.trim())
        .filter(|p| p.starts_with('-'))
        .map(String::from)
        .collect();
    if options.is_empty() {
        return Ok(());
    }
    Err(RuntimeError::Install {
        detail: format!("not a package name: {}", options.join(", ")),
        packages: options,
    })
}

fn normalize(package: &str) -> String {
    package.trim().to_ascii_lowercase().replace('_', "-")
}

fn owned(packages: &[&str]) -> Vec<String> {
    packages.iter().map(|p| p.to_string()).collect()
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
    let joined = lines[start..].join("\n");
    if joined.is_empty() {
        "pip exited with an error and no output".to_string()
    } else {
        joined
    }
}
