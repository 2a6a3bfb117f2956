//! Configuration for tether: the TOML file, logging setup, and the expansion/merge engine used
//! to resolve launch requests before a session starts.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod dbgconfig;
pub mod expand;
pub mod launch;
pub mod logging;
pub mod merge;

pub use crate::dbgconfig::{expand_dbgconfig, expand_fixed_point, ExpansionTable};
pub use crate::expand::{expand_str, expand_value, ExpandError};
pub use crate::launch::{resolve, LaunchRequest, ResolveContext, ResolveError};
pub use crate::logging::{init_tracing, LoggingConfig};
pub use crate::merge::merge;

/// Environment variable consulted for the config file path when none is given explicitly.
pub const CONFIG_ENV_VAR: &str = "TETHER_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub logging: LoggingConfig,
    pub adapter: AdapterConfig,
    pub launch: LaunchDefaults,
    /// Named values referenced as `${dbgconfig:NAME}`.
    pub dbgconfig: IndexMap<String, Value>,
    pub rpc: RpcConfig,
    pub configurations: Vec<NamedConfiguration>,
    /// Fold environment variable names to one case (Windows semantics).
    pub case_insensitive_env: bool,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            adapter: AdapterConfig::default(),
            launch: LaunchDefaults::default(),
            dbgconfig: IndexMap::new(),
            rpc: RpcConfig::default(),
            configurations: Vec::new(),
            case_insensitive_env: cfg!(windows),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Adapter executable.
    pub program: PathBuf,
    /// Backend library handed to the adapter as `--liblldb`.
    pub liblldb: Option<PathBuf>,
    /// Extra arguments appended after the generated ones.
    pub args: Vec<String>,
    /// Environment overrides; values may use `${env:NAME}`.
    pub env: IndexMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Run the adapter with debug logging for its own target.
    pub verbose: bool,
    pub handshake_timeout_ms: u64,
    /// Have the adapter connect back to us instead of listening on a port.
    pub reverse: bool,
    /// Passed verbatim to the adapter as `--settings <json>`.
    pub settings: Option<Value>,
}

impl AdapterConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("codelldb"),
            liblldb: None,
            args: Vec::new(),
            env: IndexMap::new(),
            cwd: None,
            verbose: false,
            handshake_timeout_ms: 10_000,
            reverse: false,
            settings: None,
        }
    }
}

/// Workspace-wide values merged into every launch request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LaunchDefaults {
    pub init_commands: Option<Vec<String>>,
    pub pre_run_commands: Option<Vec<String>>,
    pub post_run_commands: Option<Vec<String>>,
    pub pre_terminate_commands: Option<Vec<String>>,
    pub exit_commands: Option<Vec<String>>,
    pub env: Option<IndexMap<String, String>>,
    pub cwd: Option<String>,
    pub source_map: Option<IndexMap<String, Option<String>>>,
    pub relative_path_base: Option<String>,
    pub terminal: Option<String>,
    pub expressions: Option<String>,
    pub source_languages: Option<Vec<String>>,
}

impl LaunchDefaults {
    /// The configured defaults keyed the way launch requests spell them.
    pub fn entries(&self) -> Vec<(&'static str, Value)> {
        fn strings(items: &[String]) -> Value {
            Value::Array(items.iter().cloned().map(Value::String).collect())
        }

        let mut out = Vec::new();
        let commands = [
            ("initCommands", &self.init_commands),
            ("preRunCommands", &self.pre_run_commands),
            ("postRunCommands", &self.post_run_commands),
            ("preTerminateCommands", &self.pre_terminate_commands),
            ("exitCommands", &self.exit_commands),
            ("sourceLanguages", &self.source_languages),
        ];
        for (key, items) in commands {
            if let Some(items) = items {
                out.push((key, strings(items)));
            }
        }

        if let Some(env) = &self.env {
            let env = env
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect();
            out.push(("env", Value::Object(env)));
        }
        if let Some(source_map) = &self.source_map {
            let map = source_map
                .iter()
                .map(|(key, value)| {
                    let value = value.clone().map_or(Value::Null, Value::String);
                    (key.clone(), value)
                })
                .collect();
            out.push(("sourceMap", Value::Object(map)));
        }

        let scalars = [
            ("cwd", &self.cwd),
            ("relativePathBase", &self.relative_path_base),
            ("terminal", &self.terminal),
            ("expressions", &self.expressions),
        ];
        for (key, value) in scalars {
            if let Some(value) = value {
                out.push((key, Value::String(value.clone())));
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Address of the launch gateway; `127.0.0.1:0` picks a free port.
    pub listen: Option<SocketAddr>,
    /// Shared secret callers must present in the request's `token` field.
    pub token: Option<String>,
    pub end_of_session_timeout_ms: u64,
}

impl RpcConfig {
    pub fn end_of_session_timeout(&self) -> Duration {
        Duration::from_millis(self.end_of_session_timeout_ms)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen: None,
            token: None,
            end_of_session_timeout_ms: 5_000,
        }
    }
}

/// A launch configuration that can be started by name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NamedConfiguration {
    pub name: String,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl NamedConfiguration {
    /// The configuration as a launch request, `name` included.
    pub fn to_request(&self) -> LaunchRequest {
        let mut map = self.config.clone();
        map.insert("name".to_string(), Value::String(self.name.clone()));
        LaunchRequest::from(map)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

fn sanitize_toml_error_message(message: &str) -> String {
    // Messages like `invalid type: string "secret", expected a boolean` echo config values.
    static QUOTED_STRING_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = QUOTED_STRING_RE.get_or_init(|| {
        regex::Regex::new(r#""(?:\\.|[^"\\])*""#).expect("quoted-string regex should compile")
    });
    re.replace_all(message, r#""<redacted>""#).into_owned()
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` includes a source snippet; keep only the message.
        ConfigError::Toml(sanitize_toml_error_message(err.message()))
    }
}

impl TetherConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Path to load: the explicit one if given, otherwise `TETHER_CONFIG` when set.
    pub fn discover_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        std::env::var_os(CONFIG_ENV_VAR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    }

    /// Find a named configuration. Without a folder, the first configuration with that name in
    /// any folder matches.
    pub fn find_configuration(&self, folder: Option<&str>, name: &str) -> Option<&NamedConfiguration> {
        self.configurations.iter().find(|candidate| {
            candidate.name == name
                && match folder {
                    Some(folder) => candidate.folder.as_deref() == Some(folder),
                    None => true,
                }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn empty_file_yields_defaults() {
        let config = TetherConfig::load_from_str("").unwrap();
        assert_eq!(config, TetherConfig::default());
        assert_eq!(config.adapter.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.rpc.end_of_session_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn parses_all_sections() {
        let text = r#"
case_insensitive_env = true

[logging]
level = "debug"

[adapter]
program = "/opt/adapter/bin/codelldb"
liblldb = "/opt/adapter/lldb/lib/liblldb.so"
args = ["--multi-session"]
verbose = true
reverse = true
handshake_timeout_ms = 2500
settings = { evaluateForHovers = true }

[adapter.env]
LLDB_DEBUGSERVER_PATH = "${env:HOME}/bin/debugserver"

[launch]
init_commands = ["settings set target.x86-disassembly-flavor intel"]
exit_commands = ["script print('bye')"]
terminal = "console"

[launch.env]
RUST_BACKTRACE = "1"

[launch.source_map]
"/rustc/abc" = "/home/dev/rust"
"/build" = ""

[dbgconfig]
root = "/src"
port = 4711

[rpc]
listen = "127.0.0.1:9552"
token = "s3cret"

[[configurations]]
name = "Debug app"
folder = "app"
type = "lldb"
request = "launch"
program = "${dbgconfig:root}/target/debug/app"
"#;
        let config = TetherConfig::load_from_str(text).unwrap();

        assert!(config.case_insensitive_env);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.adapter.args, vec!["--multi-session".to_string()]);
        assert!(config.adapter.verbose && config.adapter.reverse);
        assert_eq!(config.adapter.handshake_timeout_ms, 2500);
        assert_eq!(config.adapter.settings, Some(json!({"evaluateForHovers": true})));
        assert_eq!(
            config.adapter.env.get("LLDB_DEBUGSERVER_PATH").map(String::as_str),
            Some("${env:HOME}/bin/debugserver")
        );
        assert_eq!(config.dbgconfig.get("port"), Some(&json!(4711)));
        assert_eq!(config.rpc.listen, Some("127.0.0.1:9552".parse().unwrap()));
        assert_eq!(config.rpc.token.as_deref(), Some("s3cret"));

        let named = config.find_configuration(Some("app"), "Debug app").unwrap();
        assert_eq!(
            Value::Object(named.to_request().0),
            json!({
                "name": "Debug app",
                "type": "lldb",
                "request": "launch",
                "program": "${dbgconfig:root}/target/debug/app",
            })
        );
        assert!(config.find_configuration(None, "Debug app").is_some());
        assert!(config.find_configuration(Some("other"), "Debug app").is_none());
    }

    #[test]
    fn launch_defaults_use_request_key_spelling() {
        let config = TetherConfig::load_from_str(
            r#"
[launch]
pre_run_commands = ["a"]
relative_path_base = "/ws"

[launch.source_map]
"/build" = ""
"#,
        )
        .unwrap();
        let entries: Map<String, Value> = config
            .launch
            .entries()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        assert_eq!(
            Value::Object(entries),
            json!({
                "preRunCommands": ["a"],
                "relativePathBase": "/ws",
                "sourceMap": {"/build": ""},
            })
        );
    }

    #[test]
    fn toml_errors_do_not_echo_values() {
        let err = TetherConfig::load_from_str(
            r#"
[adapter]
verbose = "super-secret-value"
"#,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(!message.contains("super-secret-value"), "{message}");
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn load_from_path_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = TetherConfig::load_from_path(&path).unwrap_err();
        match err {
            ConfigError::Io { path: reported, .. } => assert!(reported.ends_with("missing.toml")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn load_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(&path, "[rpc]\nend_of_session_timeout_ms = 100\n").unwrap();
        let config = TetherConfig::load_from_path(&path).unwrap();
        assert_eq!(config.rpc.end_of_session_timeout_ms, 100);
    }

    #[test]
    fn explicit_path_wins_over_environment() {
        let explicit = Path::new("/etc/tether.toml");
        assert_eq!(
            TetherConfig::discover_path(Some(explicit)),
            Some(explicit.to_path_buf())
        );
    }
}
