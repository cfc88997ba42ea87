use std::{
    collections::HashMap,
    env,
    fs,
    path::PathBuf,
};

use directories::BaseDirs;

/// Prefix accepted on environment variables, e.g. `SANDBOX_WORKER_PYTHON_BIN`.
pub const ENV_PREFIX: &str = "SANDBOX_WORKER_";

/// Key/value settings: defaults, overlaid by the rc file, overlaid by the environment.
#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        let config_path = default_config_path();
        let rc = fs::read_to_string(&config_path).unwrap_or_default();
        Self::from_sources(config_path, &rc, env::vars())
    }

    /// Build from rc-file text and `(key, value)` environment pairs.
    pub fn from_sources<I>(config_path: PathBuf, rc: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = default_map();

        for line in rc.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }

        // Environment takes precedence over the rc file.
        for (k, v) in vars {
            if let Some(stripped) = k.strip_prefix(ENV_PREFIX) {
                map.insert(stripped.to_string(), v);
            } else if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, config_path }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.inner.insert(key.to_string(), value.into());
    }

    /// Like `get`, but `auto`, `default` and blank values mean unset.
    pub fn get_opt(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| {
            let v = v.trim();
            !v.is_empty() && !v.eq_ignore_ascii_case("auto") && !v.eq_ignore_ascii_case("default")
        })
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get_opt(key).map(PathBuf::from)
    }

    /// Comma-separated list; blank entries dropped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn is_config_key(k: &str) -> bool {
    const KEYS: &[&str] = &[
        "PYTHON_BIN",
        "PACKAGE_DIR",
        "DATA_DIR",
        "PIP_INDEX_URL",
        "PIP_NO_INDEX",
        "BASELINE_PACKAGES",
        "EAGER_INIT",
        "QUEUE_CAPACITY",
        "REQUEST_TIMEOUT",
        "STARTUP_TIMEOUT",
        "COLLECT_FILES",
        "MAX_FILE_SIZE",
        "LOG_LEVEL",
        "LOG_JSON",
    ];

    KEYS.contains(&k)
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("sandbox_worker").join(".workerrc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();

    // Paths ("auto" = per-runtime scratch dir / PATH lookup)
    m.insert("PYTHON_BIN".into(), "auto".into());
    m.insert("PACKAGE_DIR".into(), "auto".into());
    m.insert("DATA_DIR".into(), "auto".into());

    // Package sources
    m.insert("PIP_INDEX_URL".into(), "default".into());
    m.insert("PIP_NO_INDEX".into(), "false".into());
    m.insert("BASELINE_PACKAGES".into(), "".into());

    // Numbers
    m.insert("QUEUE_CAPACITY".into(), "64".into());
    m.insert("REQUEST_TIMEOUT".into(), "60".into());
    m.insert("STARTUP_TIMEOUT".into(), "30".into());
    m.insert("MAX_FILE_SIZE".into(), (50u64 * 1024 * 1024).to_string());

    // Bools as strings
    m.insert("EAGER_INIT".into(), "false".into());
    m.insert("COLLECT_FILES".into(), "true".into());
    m.insert("LOG_JSON".into(), "false".into());

    m.insert("LOG_LEVEL".into(), "sandbox_worker=info".into());

    m
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_apply_without_sources() {
        let cfg = Config::from_sources(PathBuf::from("/nowhere/.workerrc"), "", Vec::new());
        assert_eq!(cfg.get_usize("QUEUE_CAPACITY"), Some(64));
        assert_eq!(cfg.get_path("PYTHON_BIN"), None);
        assert!(cfg.get_bool("COLLECT_FILES"));
        assert!(cfg.get_list("BASELINE_PACKAGES").is_empty());
    }

    #[test]
    fn rc_file_then_environment() {
        let rc = "# comment\nQUEUE_CAPACITY = 8\nPYTHON_BIN=/usr/bin/python3\nBASELINE_PACKAGES = numpy, ,pandas\n";
        let env = vars(&[
            ("QUEUE_CAPACITY", "16"),
            ("SANDBOX_WORKER_PIP_NO_INDEX", "1"),
            ("HOME", "/root"),
        ]);
        let cfg = Config::from_sources(PathBuf::from("/x/.workerrc"), rc, env);
        assert_eq!(cfg.get_usize("QUEUE_CAPACITY"), Some(16));
        assert_eq!(cfg.get_path("PYTHON_BIN"), Some(PathBuf::from("/usr/bin/python3")));
        assert_eq!(cfg.get_list("BASELINE_PACKAGES"), vec!["numpy", "pandas"]);
        assert!(cfg.get_bool("PIP_NO_INDEX"));
        assert_eq!(cfg.get("HOME"), None);
    }

    #[test]
    fn auto_and_default_mean_unset() {
        let mut cfg = Config::from_sources(PathBuf::from("/x/.workerrc"), "", Vec::new());
        assert_eq!(cfg.get_opt("PIP_INDEX_URL"), None);
        cfg.set("PIP_INDEX_URL", "https://mirror.example/simple");
        assert_eq!(cfg.get_opt("PIP_INDEX_URL").as_deref(), Some("https://mirror.example/simple"));
    }
}
