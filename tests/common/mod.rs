//! Scripted in-memory runtime for exercising the worker without an interpreter.
//!
//! One instruction per line:
//! - `print TEXT` / `eprint TEXT`: emit a line; `{name}` is replaced by a global's JSON
//! - `set NAME JSON`: define a global
//! - `get NAME`: result is the global's value, or a `NameError`
//! - `return JSON`: result is the literal value
//! - `import PKG`: `ModuleNotFoundError` unless PKG was installed
//! - `raise MSG`: fail with `RuntimeError: MSG`
//! - `touch NAME TEXT`: create a file in the data directory
//! - `sleep MS`: wait
//! - `exit`: the runtime dies

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox_worker::execution::{ContextVars, OutputCapture, Stream};
use sandbox_worker::runtime::{Runtime, RuntimeError, RuntimeProvider};
use serde_json::Value;

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub struct ScriptedProvider {
    pub provisions: Arc<AtomicUsize>,
    pub journal: Journal,
    delay: Duration,
    failure: Option<String>,
    available: HashSet<String>,
    data_dir: Option<PathBuf>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            provisions: Arc::default(),
            journal: Journal::default(),
            delay: Duration::ZERO,
            failure: None,
            available: HashSet::new(),
            data_dir: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, reason: &str) -> Self {
        self.failure = Some(reason.to_string());
        self
    }

    pub fn with_packages(mut self, names: &[&str]) -> Self {
        self.available.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn with_data_dir(mut self, dir: &Path) -> Self {
        self.data_dir = Some(dir.to_path_buf());
        self
    }

    pub fn provision_count(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn provision(&self) -> Result<Box<dyn Runtime>, RuntimeError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        self.journal.record("provision");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(reason) = &self.failure {
            return Err(RuntimeError::Unavailable(reason.clone()));
        }
        Ok(Box::new(ScriptedRuntime {
            globals: HashMap::new(),
            installed: HashSet::new(),
            available: self.available.clone(),
            journal: self.journal.clone(),
            data_dir: self.data_dir.clone(),
            alive: true,
        }))
    }
}

pub struct ScriptedRuntime {
    globals: HashMap<String, Value>,
    installed: HashSet<String>,
    available: HashSet<String>,
    journal: Journal,
    data_dir: Option<PathBuf>,
    alive: bool,
}

impl ScriptedRuntime {
    fn render(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (name, value) in &self.globals {
            out = out.replace(&format!("{{{}}}", name), &value.to_string());
        }
        out
    }
}

#[async_trait]
impl Runtime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn install(&mut self, packages: &[String]) -> Result<(), RuntimeError> {
        if let Some(missing) = packages.iter().find(|p| !self.available.contains(*p)) {
            return Err(RuntimeError::Install {
                packages: packages.to_vec(),
                detail: format!("No matching distribution found for {}", missing),
            });
        }
        for package in packages {
            if self.installed.insert(package.clone()) {
                self.journal.record(format!("install {}", package));
            }
        }
        Ok(())
    }

    async fn bind(&mut self, vars: &ContextVars) -> Result<(), RuntimeError> {
        for (name, value) in vars.as_map() {
            self.journal.record(format!("bind {}", name));
            self.globals.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn unbind(&mut self, names: &[String]) -> Result<(), RuntimeError> {
        for name in names {
            self.journal.record(format!("unbind {}", name));
            self.globals.remove(name);
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        code: &str,
        output: &mut OutputCapture,
    ) -> Result<Option<Value>, RuntimeError> {
        self.journal.record(format!("exec {}", code.lines().next().unwrap_or("")));
        let mut result = None;
        for line in code.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (op, rest) = line.split_once(' ').unwrap_or((line, ""));
            result = None;
            match op {
                "print" => output.push(Stream::Stdout, &self.render(rest)),
                "eprint" => output.push(Stream::Stderr, &self.render(rest)),
                "set" => {
                    let (name, json) = rest.split_once(' ').unwrap();
                    self.globals.insert(name.to_string(), serde_json::from_str(json).unwrap());
                }
                "get" => match self.globals.get(rest) {
                    Some(value) => result = Some(value.clone()),
                    None => {
                        return Err(RuntimeError::Raised(format!(
                            "NameError: name '{}' is not defined",
                            rest
                        )))
                    }
                },
                "return" => result = Some(serde_json::from_str(rest).unwrap()),
                "import" => {
                    if !self.installed.contains(rest) {
                        return Err(RuntimeError::Raised(format!(
                            "ModuleNotFoundError: No module named '{}'",
                            rest
                        )));
                    }
                }
                "raise" => return Err(RuntimeError::Raised(format!("RuntimeError: {}", rest))),
                "touch" => {
                    let (name, text) = rest.split_once(' ').unwrap_or((rest, ""));
                    let dir = self.data_dir.as_ref().expect("touch needs a data dir");
                    std::fs::write(dir.join(name), text).unwrap();
                }
                "sleep" => {
                    let ms: u64 = rest.parse().unwrap();
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                "exit" => {
                    self.alive = false;
                    return Err(RuntimeError::Protocol("interpreter exited unexpectedly".into()));
                }
                other => panic!("unknown scripted op `{}`", other),
            }
        }
        Ok(result)
    }

    fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        self.journal.record("shutdown");
        Ok(())
    }
}
