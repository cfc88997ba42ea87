//! Python interpreter process bootstrap and I/O glue.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use super::ProcessHandle;

pub struct PythonLaunch<'a> {
    pub interpreter: &'a Path,
    pub bootstrap: &'a str,
    /// Prepended to `sys.path`; packages are installed here.
    pub site_dir: &'a Path,
    /// Working directory of the interpreter.
    pub work_dir: &'a Path,
}

/// Use the configured interpreter if given, else the first of `python3`/`python` on PATH.
pub fn resolve_interpreter(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        return which::which(path).ok();
    }
    ["python3", "python"]
        .into_iter()
        .find_map(|name| which::which(name).ok())
}

pub async fn start_python(launch: &PythonLaunch<'_>) -> io::Result<ProcessHandle> {
    let mut cmd = Command::new(launch.interpreter);
    cmd.arg("-I") // isolated: ignore PYTHON* env and user site
        .arg("-u") // unbuffered
        .arg("-X")
        .arg("utf8")
        .arg("-c")
        .arg(launch.bootstrap)
        .arg(launch.site_dir)
        .current_dir(launch.work_dir)
        .env_clear()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(path) = std::env::var_os("PATH") {
        cmd.env("PATH", path);
    }

    let child: Child = cmd.spawn()?;
    ProcessHandle::new(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_configured_interpreter_resolves_to_none() {
        let bogus = Path::new("/definitely/not/a/python-binary");
        assert!(resolve_interpreter(Some(bogus)).is_none());
    }
}
