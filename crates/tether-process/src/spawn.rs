use std::path::PathBuf;

use tether_config::expand::ExpandError;
use tether_config::AdapterConfig;

use crate::environment::{adapter_environment, Environment};

/// `RUST_LOG` for a verbose adapter: its own target at debug, everything else quiet.
const VERBOSE_LOG_FILTER: &str = "error,codelldb=debug";

/// How the adapter reaches us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnMode {
    /// The adapter listens on a port of its choosing and announces it on stdout.
    Listen,
    /// The adapter connects back to a port we are listening on.
    Connect { port: u16 },
}

/// Everything needed to start one adapter process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSpawnParams {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Environment,
    /// Ignored at spawn time if it is not an existing directory.
    pub cwd: Option<PathBuf>,
}

impl AdapterSpawnParams {
    /// Params for `program` with no arguments and the current process environment.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Environment::from_process(cfg!(windows)),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Assemble the adapter command line and environment from the `[adapter]` section.
    pub fn build(
        config: &AdapterConfig,
        base_env: &Environment,
        mode: &SpawnMode,
        auth_token: Option<&str>,
    ) -> Result<Self, ExpandError> {
        let mut args = Vec::new();
        if let Some(liblldb) = &config.liblldb {
            args.push("--liblldb".to_string());
            args.push(liblldb.display().to_string());
        }
        match mode {
            SpawnMode::Listen => {
                args.push("--port".to_string());
                args.push("0".to_string());
            }
            SpawnMode::Connect { port } => {
                args.push("--connect".to_string());
                args.push(port.to_string());
            }
        }
        if let Some(token) = auth_token {
            args.push("--auth-token".to_string());
            args.push(token.to_string());
        }
        if let Some(settings) = &config.settings {
            args.push("--settings".to_string());
            args.push(settings.to_string());
        }
        args.extend(config.args.iter().cloned());

        let mut env = adapter_environment(base_env, &config.env)?;
        env.insert("RUST_BACKTRACE", "1");
        if config.verbose {
            env.insert("RUST_LOG", VERBOSE_LOG_FILTER);
        }

        Ok(Self {
            program: config.program.clone(),
            args,
            env,
            cwd: config.cwd.clone(),
        })
    }
}
