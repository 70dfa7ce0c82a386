//! Server configuration: a `clap`-derived CLI layered over an optional TOML
//! config file, following the teacher's CLI-then-config-file precedence
//! (`bin/pageserver.rs`'s `initialize_config`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_blocklen() -> u32 {
    4096
}

fn default_nreaders() -> usize {
    4
}

fn default_opps() -> u32 {
    10
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Server configuration, loadable from a TOML file and overridable by CLI
/// flags or environment variables (via `clap`'s `env` feature).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Fixed block size in bytes, set once at server creation time.
    #[serde(default = "default_blocklen")]
    pub blocklen: u32,

    /// Number of reader workers in the dispatcher's pool.
    #[serde(default = "default_nreaders")]
    pub nreaders: usize,

    /// DynamoDB table backing the KV store.
    pub table: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Override endpoint, e.g. for a local DynamoDB-compatible test server.
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Target operations-per-second. Also determines the rate-limited
    /// retry delay (`1s / opps`) once the KV queue has been throttled.
    #[serde(default = "default_opps")]
    pub opps: u32,

    /// Emit logs as JSON instead of human-readable text.
    #[serde(default)]
    pub json_logs: bool,

    /// Static AWS credentials, for test/local setups that don't go through
    /// the default provider chain (environment, profile, IMDS). Zeroized
    /// once consumed by [`crate::kv::DynamoKv::from_config`].
    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: default_listen_addr(),
            blocklen: default_blocklen(),
            nreaders: default_nreaders(),
            table: String::new(),
            region: default_region(),
            endpoint_url: None,
            opps: default_opps(),
            json_logs: false,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

/// Log-Backed Storage server: an append-only block service backed by a
/// DynamoDB-KV store.
#[derive(Debug, Parser)]
#[command(name = "lbsd", version, about)]
pub struct Cli {
    /// Path to a TOML config file. CLI flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "LBSD_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    #[arg(long, env = "LBSD_BLOCKLEN")]
    pub blocklen: Option<u32>,

    #[arg(long, env = "LBSD_NREADERS")]
    pub nreaders: Option<usize>,

    #[arg(long, env = "LBSD_TABLE")]
    pub table: Option<String>,

    #[arg(long, env = "LBSD_REGION")]
    pub region: Option<String>,

    #[arg(long, env = "LBSD_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    #[arg(long, env = "LBSD_OPPS")]
    pub opps: Option<u32>,

    #[arg(long)]
    pub json_logs: bool,

    #[arg(long, env = "LBSD_ACCESS_KEY_ID")]
    pub access_key_id: Option<String>,

    #[arg(long, env = "LBSD_SECRET_ACCESS_KEY")]
    pub secret_access_key: Option<String>,
}

impl Cli {
    /// Merge a config file (if given) with CLI overrides. CLI values that
    /// were actually supplied win; everything else falls back to the file,
    /// then to the built-in defaults.
    pub fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => load_config_file(path)?,
            None => Config::default(),
        };

        if let Some(v) = self.listen_addr {
            cfg.listen_addr = v;
        }
        if let Some(v) = self.blocklen {
            cfg.blocklen = v;
        }
        if let Some(v) = self.nreaders {
            cfg.nreaders = v;
        }
        if let Some(v) = self.table {
            cfg.table = v;
        }
        if let Some(v) = self.region {
            cfg.region = v;
        }
        if self.endpoint_url.is_some() {
            cfg.endpoint_url = self.endpoint_url;
        }
        if let Some(v) = self.opps {
            cfg.opps = v;
        }
        if self.json_logs {
            cfg.json_logs = true;
        }
        if self.access_key_id.is_some() {
            cfg.access_key_id = self.access_key_id;
        }
        if self.secret_access_key.is_some() {
            cfg.secret_access_key = self.secret_access_key;
        }

        anyhow::ensure!(!cfg.table.is_empty(), "a DynamoDB table name is required");

        Ok(cfg)
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let cfg: Config = toml::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_file_values() {
        let mut from_file = Config::default();
        from_file.table = "file-table".to_string();
        from_file.opps = 5;

        let cli = Cli {
            config: None,
            listen_addr: None,
            blocklen: None,
            nreaders: None,
            table: Some("cli-table".to_string()),
            region: None,
            endpoint_url: None,
            opps: None,
            json_logs: false,
            access_key_id: None,
            secret_access_key: None,
        };

        // Simulate the merge step directly on an in-memory "file" config,
        // since into_config() reads from disk when `config` is set.
        let mut cfg = from_file;
        if let Some(v) = cli.table {
            cfg.table = v;
        }
        assert_eq!(cfg.table, "cli-table");
        assert_eq!(cfg.opps, 5);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.blocklen, 4096);
        assert_eq!(cfg.nreaders, 4);
        assert_eq!(cfg.opps, 10);
    }

    #[test]
    fn parses_toml_config_file() {
        let toml_text = r#"
            table = "blocks"
            region = "eu-west-1"
            opps = 25
        "#;
        let cfg: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.table, "blocks");
        assert_eq!(cfg.region, "eu-west-1");
        assert_eq!(cfg.opps, 25);
        // Fields absent from the file fall back to serde defaults.
        assert_eq!(cfg.blocklen, 4096);
    }
}
