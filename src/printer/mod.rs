//! Printers for execution results: plain or colored text, and raw JSON.

use std::fmt::Write as _;

use owo_colors::OwoColorize;
use sandbox_worker::ExecutionResult;

pub struct ResultPrinter {
    pub color: bool,
}

impl ResultPrinter {
    pub fn print(&self, result: &ExecutionResult) {
        let out = self.render_stdout(result);
        if !out.is_empty() {
            print!("{}", out);
        }
        if let Some(err) = &result.stderr {
            if self.color {
                eprintln!("{}", err.red());
            } else {
                eprintln!("{}", err);
            }
        }
    }

    /// Everything destined for stdout: captured output, the result value, and a file listing.
    pub fn render_stdout(&self, result: &ExecutionResult) -> String {
        let mut text = String::new();
        if let Some(out) = &result.stdout {
            let _ = writeln!(text, "{}", out);
        }
        if let Some(value) = &result.result {
            let shown = match value {
                serde_json::Value::String(s) => format!("{:?}", s),
                other => other.to_string(),
            };
            if self.color {
                let _ = writeln!(text, "{} {}", "=>".green(), shown);
            } else {
                let _ = writeln!(text, "=> {}", shown);
            }
        }
        for file in result.files.iter().flatten() {
            let line = format!("[file] {} ({} bytes)", file.name, file.size);
            if self.color {
                let _ = writeln!(text, "{}", line.cyan());
            } else {
                let _ = writeln!(text, "{}", line);
            }
        }
        text
    }
}

pub struct JsonPrinter;

impl JsonPrinter {
    pub fn print(&self, result: &ExecutionResult) {
        println!("{}", result.to_json());
    }
}
