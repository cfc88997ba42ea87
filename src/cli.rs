use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser, Debug, Clone)]
#[command(name = "sandbox-worker", about = "Sandboxed Python code-execution worker", version)]
pub struct Cli {
    /// Python interpreter to run code with (overrides PYTHON_BIN).
    #[arg(long, global = true, value_name = "PATH")]
    pub python: Option<PathBuf>,

    /// Debug-level logging for this crate (RUST_LOG still wins).
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve requests over stdio: one JSON request per input line, one JSON response per output line.
    Serve {
        /// Provision the runtime before the first request arrives.
        #[arg(long)]
        eager: bool,

        /// Extra baseline package, installed right after provisioning.
        /// Can be used multiple times: --package numpy --package pandas
        #[arg(short = 'p', long = "package", action = clap::ArgAction::Append)]
        packages: Vec<String>,
    },

    /// Execute a single source file ("-" reads stdin) and print the result.
    Exec {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Package to install before running.
        #[arg(short = 'p', long = "package", action = clap::ArgAction::Append)]
        packages: Vec<String>,

        /// Context variable as NAME=VALUE; VALUE is parsed as JSON, else taken as a string.
        #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var, action = clap::ArgAction::Append)]
        vars: Vec<(String, Value)>,

        /// Print the raw response object instead of formatted output.
        #[arg(long)]
        json: bool,

        /// Seconds to wait for the result (overrides REQUEST_TIMEOUT; 0 waits forever).
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Write files the code created into this directory.
        #[arg(long = "out-dir", value_name = "DIR")]
        out_dir: Option<PathBuf>,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

pub fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{}`", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("variable name is empty".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn var_values_are_json_when_possible() {
        assert_eq!(parse_var("n=5").unwrap(), ("n".to_string(), json!(5)));
        assert_eq!(parse_var("xs=[1,2]").unwrap().1, json!([1, 2]));
        assert_eq!(parse_var("name=alice").unwrap().1, json!("alice"));
        assert_eq!(parse_var("eq=a=b").unwrap().1, json!("a=b"));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn exec_subcommand_collects_repeated_flags() {
        let cli = <Cli as Parser>::try_parse_from([
            "sandbox-worker",
            "exec",
            "job.py",
            "-p",
            "numpy",
            "--package",
            "pandas",
            "--var",
            "x=1",
            "--python",
            "/usr/bin/python3",
        ])
        .unwrap();
        assert_eq!(cli.python, Some(PathBuf::from("/usr/bin/python3")));
        match cli.command {
            Command::Exec { path, packages, vars, json, timeout, out_dir } => {
                assert_eq!(path, PathBuf::from("job.py"));
                assert_eq!(packages, vec!["numpy", "pandas"]);
                assert_eq!(vars, vec![("x".to_string(), json!(1))]);
                assert!(!json);
                assert_eq!(timeout, None);
                assert_eq!(out_dir, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
