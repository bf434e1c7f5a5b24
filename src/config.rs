//! Flat `key=value` configuration.
//!
//! Blank lines and `#` comments are ignored; whitespace around keys and
//! values is trimmed. Unknown keys are preserved across save/load so
//! forward-compatible settings survive a round trip.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Node configuration backed by a flat key=value map.
#[derive(Debug, Clone)]
pub struct Config {
    values: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut values = BTreeMap::new();
        values.insert("server.port".to_string(), "8080".to_string());
        values.insert("server.max_connections".to_string(), "100".to_string());
        values.insert("discovery.enabled".to_string(), "true".to_string());
        values.insert("discovery.port".to_string(), "8081".to_string());
        values.insert("transfer.chunk_size".to_string(), "65536".to_string());
        values.insert("transfer.max_parallel".to_string(), "4".to_string());
        values.insert("storage.base_dir".to_string(), "~/.hypershare".to_string());
        values.insert(
            "ipc.socket".to_string(),
            "/tmp/hypershare.sock".to_string(),
        );
        values.insert("log.level".to_string(), "info".to_string());
        values.insert("log.file".to_string(), "hypershare.log".to_string());
        Self { values }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config file over the defaults. Keys in the file win.
    pub fn load_from_file(path: &Path) -> io::Result<Self> {
        let mut config = Self::default();
        let content = fs::read_to_string(path)?;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(eq) = line.find('=') else {
                continue;
            };
            let key = line[..eq].trim();
            let value = line[eq + 1..].trim();
            if !key.is_empty() {
                config.values.insert(key.to_string(), value.to_string());
            }
        }
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> io::Result<()> {
        let mut content = String::from("# HyperShare Configuration\n\n");
        for (key, value) in &self.values {
            content.push_str(key);
            content.push('=');
            content.push_str(value);
            content.push('\n');
        }
        fs::write(path, content)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_u16(&self, key: &str, default: u16) -> u16 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(value) => matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
            None => default,
        }
    }

    pub fn server_port(&self) -> u16 {
        self.get_u16("server.port", 8080)
    }

    pub fn discovery_enabled(&self) -> bool {
        self.get_bool("discovery.enabled", true)
    }

    pub fn discovery_port(&self) -> u16 {
        self.get_u16("discovery.port", 8081)
    }

    pub fn chunk_size(&self) -> u32 {
        self.get_u32("transfer.chunk_size", 65536)
    }

    pub fn max_parallel(&self) -> u32 {
        self.get_u32("transfer.max_parallel", 4)
    }

    pub fn log_level(&self) -> String {
        self.get_string("log.level", "info")
    }

    pub fn ipc_socket_path(&self) -> PathBuf {
        PathBuf::from(self.get_string("ipc.socket", "/tmp/hypershare.sock"))
    }

    /// Storage base directory with a leading `~/` expanded against `$HOME`.
    pub fn storage_base_dir(&self) -> PathBuf {
        let raw = self.get_string("storage.base_dir", "~/.hypershare");
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        PathBuf::from(raw)
    }
}
