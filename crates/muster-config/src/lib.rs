//! Layered configuration for muster.
//!
//! Reads the MCP server table from the first source that exists, with
//! precedence: `--config` > `MUSTER_CONFIG` > `./muster.toml` >
//! `~/.muster/config.toml` > defaults.

mod error;

pub use error::ConfigError;

use muster_mcp::McpConfig;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "MUSTER_CONFIG";

/// Environment variable overriding the config directory.
pub const CONFIG_DIR_ENV: &str = "MUSTER_CONFIG_DIR";

/// Config file looked up in the working directory.
pub const PROJECT_FILE: &str = "muster.toml";

/// Resolved configuration for a muster process.
#[derive(Debug, Clone)]
pub struct MusterConfig {
    pub mcp: McpConfig,
    /// The file the configuration came from, if any.
    pub source: Option<PathBuf>,
    pub config_dir: PathBuf,
}

impl MusterConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. `explicit` (the `--config` flag)
    /// 2. `MUSTER_CONFIG`
    /// 3. `./muster.toml`
    /// 4. `~/.muster/config.toml`
    /// 5. Defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::load_from(explicit, from_env.as_deref(), &cwd, config_dir())
    }

    /// [`load`](Self::load) with every input passed in.
    pub fn load_from(
        explicit: Option<&Path>,
        from_env: Option<&Path>,
        cwd: &Path,
        config_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        // Named files must exist and parse.
        if let Some(path) = explicit.or(from_env) {
            let mcp = read_config_file(path)?;
            validate(&mcp)?;
            return Ok(Self {
                mcp,
                source: Some(path.to_path_buf()),
                config_dir,
            });
        }

        // Discovered files are skipped when they do not parse.
        let candidates = [cwd.join(PROJECT_FILE), config_dir.join("config.toml")];
        for path in candidates {
            if !path.is_file() {
                continue;
            }
            match read_config_file(&path) {
                Ok(mcp) => {
                    validate(&mcp)?;
                    tracing::debug!("Loaded configuration from {}", path.display());
                    return Ok(Self {
                        mcp,
                        source: Some(path),
                        config_dir,
                    });
                }
                Err(e) => tracing::warn!("{e}"),
            }
        }

        Ok(Self {
            mcp: McpConfig::default(),
            source: None,
            config_dir,
        })
    }
}

/// Get the muster config directory path (~/.muster/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".muster")
}

/// Read and parse one config file. `.json` files are JSON, anything else TOML.
pub fn read_config_file(path: &Path) -> Result<McpConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    parse_config(&content, is_json).map_err(|message| ConfigError::Parse {
        path: path.display().to_string(),
        message,
    })
}

fn parse_config(content: &str, is_json: bool) -> Result<McpConfig, String> {
    if is_json {
        serde_json::from_str(content).map_err(|e| e.to_string())
    } else {
        toml::from_str(content).map_err(|e| e.to_string())
    }
}

/// Reject configurations the client cannot run with.
pub fn validate(config: &McpConfig) -> Result<(), ConfigError> {
    let invalid = |key: String, message: &str| ConfigError::InvalidValue {
        key,
        message: message.to_string(),
    };

    for (name, server) in &config.servers {
        if name.trim().is_empty() {
            return Err(invalid("servers".into(), "server names must not be empty"));
        }
        if name.contains('.') {
            return Err(invalid(
                format!("servers.{name}"),
                "server names must not contain '.'",
            ));
        }
        if server.command.trim().is_empty() {
            return Err(invalid(
                format!("servers.{name}.command"),
                "command must not be empty",
            ));
        }
        if server.timeout_ms == 0 {
            return Err(invalid(
                format!("servers.{name}.timeout_ms"),
                "timeout must be greater than zero",
            ));
        }
    }

    if config.breaker.failure_threshold == 0 {
        return Err(invalid(
            "breaker.failure_threshold".into(),
            "must be at least 1",
        ));
    }
    if config.health.failure_threshold == 0 {
        return Err(invalid(
            "health.failure_threshold".into(),
            "must be at least 1",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
handshake_timeout_ms = 5000

[servers.fs]
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
env = { LOG_LEVEL = "info" }

[servers.git]
command = "uvx"
args = ["mcp-server-git"]
timeout_ms = 60000
disabled = true

[retry]
max_retries = 4

[health]
interval_ms = 10000
"#;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_parse_full_toml() {
        let config = parse_config(SAMPLE, false).unwrap();
        assert_eq!(config.handshake_timeout_ms, 5000);
        assert_eq!(config.servers.len(), 2);
        let fs = &config.servers["fs"];
        assert_eq!(fs.command, "npx");
        assert_eq!(fs.args.len(), 3);
        assert_eq!(fs.env["LOG_LEVEL"], "info");
        assert!(!fs.disabled);
        assert!(config.servers["git"].disabled);
        assert_eq!(config.servers["git"].timeout_ms, 60000);
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.health.interval_ms, 10000);
        assert_eq!(config.health.failure_threshold, 3);
    }

    #[test]
    fn test_json_accepts_mcp_servers_key() {
        let json = r#"{"mcpServers": {"github": {"command": "npx", "args": ["server-github"]}}}"#;
        let config = parse_config(json, true).unwrap();
        assert_eq!(config.servers["github"].command, "npx");
    }

    #[test]
    fn test_explicit_file_wins() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), PROJECT_FILE, "[servers.project]\ncommand = \"a\"\n");
        let explicit = write(dir.path(), "explicit.toml", "[servers.explicit]\ncommand = \"b\"\n");
        let env = write(dir.path(), "env.toml", "[servers.env]\ncommand = \"c\"\n");

        let loaded = MusterConfig::load_from(
            Some(&explicit),
            Some(&env),
            dir.path(),
            dir.path().join("home"),
        )
        .unwrap();
        assert!(loaded.mcp.servers.contains_key("explicit"));
        assert_eq!(loaded.source.as_deref(), Some(explicit.as_path()));

        let loaded =
            MusterConfig::load_from(None, Some(&env), dir.path(), dir.path().join("home"))
                .unwrap();
        assert!(loaded.mcp.servers.contains_key("env"));
    }

    #[test]
    fn test_project_file_before_global() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        fs::create_dir(&home).unwrap();
        write(&home, "config.toml", "[servers.global]\ncommand = \"g\"\n");

        let loaded = MusterConfig::load_from(None, None, dir.path(), home.clone()).unwrap();
        assert!(loaded.mcp.servers.contains_key("global"));

        write(dir.path(), PROJECT_FILE, "[servers.project]\ncommand = \"p\"\n");
        let loaded = MusterConfig::load_from(None, None, dir.path(), home).unwrap();
        assert!(loaded.mcp.servers.contains_key("project"));
        assert!(!loaded.mcp.servers.contains_key("global"));
    }

    #[test]
    fn test_broken_discovered_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        fs::create_dir(&home).unwrap();
        write(dir.path(), PROJECT_FILE, "[servers.project\ncommand = ");
        write(&home, "config.toml", "[servers.global]\ncommand = \"g\"\n");

        let loaded = MusterConfig::load_from(None, None, dir.path(), home).unwrap();
        assert!(loaded.mcp.servers.contains_key("global"));
    }

    #[test]
    fn test_broken_explicit_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let bad = write(dir.path(), "bad.toml", "not = [valid");
        let result = MusterConfig::load_from(Some(&bad), None, dir.path(), dir.path().into());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));

        let missing = dir.path().join("nope.toml");
        let result =
            MusterConfig::load_from(Some(&missing), None, dir.path(), dir.path().into());
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_defaults_when_nothing_exists() {
        let dir = TempDir::new().unwrap();
        let loaded =
            MusterConfig::load_from(None, None, dir.path(), dir.path().join("home")).unwrap();
        assert!(loaded.mcp.servers.is_empty());
        assert!(loaded.source.is_none());
    }

    #[test]
    fn test_rejects_dotted_server_name() {
        let config = parse_config("[servers.\"a.b\"]\ncommand = \"x\"\n", false).unwrap();
        match validate(&config) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "servers.a.b"),
            other => panic!("Expected InvalidValue, got: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_empty_command() {
        let config = parse_config("[servers.fs]\ncommand = \"  \"\n", false).unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_breaker_threshold() {
        let config = parse_config("[breaker]\nfailure_threshold = 0\n", false).unwrap();
        assert!(validate(&config).is_err());
    }
}
