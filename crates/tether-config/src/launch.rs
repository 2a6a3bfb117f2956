//! Launch-request resolution: workspace defaults, `${...}` variables and request rewrites.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::dbgconfig::{expand_dbgconfig, expand_fixed_point};
use crate::expand::{expand_value, ExpandError};
use crate::merge::{is_empty, merge};
use crate::TetherConfig;

/// An external launch configuration: an arbitrary JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchRequest(pub Map<String, Value>);

impl LaunchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self, ResolveError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(ResolveError::NotAnObject),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for LaunchRequest {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Expand(#[from] ExpandError),

    #[error("launch configuration must be an object")]
    NotAnObject,
}

/// Values for the variables a launch request may reference.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub workspace_folder: Option<PathBuf>,
    pub env: IndexMap<String, String>,
}

impl ResolveContext {
    pub fn from_process_env(workspace_folder: Option<PathBuf>) -> Self {
        Self {
            workspace_folder,
            env: std::env::vars().collect(),
        }
    }

    fn variable(&self, name: &str) -> Option<String> {
        let folder = self.workspace_folder.as_ref()?;
        match name {
            "workspaceFolder" | "workspaceRoot" => Some(folder.display().to_string()),
            "workspaceFolderBasename" => folder
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            _ => None,
        }
    }
}

/// Keys whose workspace defaults run after the launch-specific values instead of before.
const TRAILING_DEFAULTS: &[&str] = &["exitCommands"];

/// Resolve `request` against the workspace configuration.
///
/// Fails before anything is started when `[dbgconfig]` has a cycle or a request references an
/// undefined `${dbgconfig:NAME}`.
pub fn resolve(
    request: LaunchRequest,
    config: &TetherConfig,
    cx: &ResolveContext,
) -> Result<LaunchRequest, ResolveError> {
    let table = expand_fixed_point(config.dbgconfig.clone())?;

    let mut map = request.0;
    for (key, default) in config.launch.entries() {
        let specific = map.remove(key);
        let requested = specific.is_some();
        let merged = if TRAILING_DEFAULTS.contains(&key) {
            merge(specific, Some(default))
        } else {
            merge(Some(default), specific)
        };
        // Empty defaults are not written into requests that never mentioned the key.
        match merged {
            Some(value) if requested || !is_empty(&value) => {
                map.insert(key.to_string(), value);
            }
            _ => {}
        }
    }

    // dbgconfig values may themselves contain `${env:...}` and friends, so they go first.
    let mut value = Value::Object(map);
    expand_dbgconfig(&mut value, &table)?;
    expand_value(&mut value, &mut |ty, name| match ty {
        Some("env") => Ok(Some(cx.env.get(name).cloned().unwrap_or_default())),
        None => Ok(cx.variable(name)),
        Some(_) => Ok(None),
    })?;
    let mut request = LaunchRequest::from_value(value)?;

    if request.get_str("request") == Some("custom") {
        request.insert("request", Value::String("launch".to_string()));
        request.insert("custom", Value::Bool(true));
    }

    let needs_name = request.name().map_or(true, str::is_empty);
    if needs_name {
        if let Some(program) = request.get_str("program").map(str::to_string) {
            request.insert("name", Value::String(program));
        }
    }

    tracing::debug!(
        target: "tether.config",
        name = request.name().unwrap_or_default(),
        "resolved launch configuration"
    );
    Ok(request)
}
