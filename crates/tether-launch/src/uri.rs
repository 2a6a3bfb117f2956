//! Launch URIs.
//!
//! - `/launch?folder=F,name=N` starts a configuration by name. Parameters are separated by `,`
//!   or `&`; without `folder`, every folder is tried.
//! - `/launch/command?KEY=VALUE&...&<command line>` starts a program. The last `&`-separated
//!   fragment is the command line, split with shell quoting rules; earlier fragments are
//!   environment assignments.
//! - `/launch/config?<yaml>` starts an inline configuration document.
//!
//! Every component is percent-decoded.

use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use tether_config::LaunchRequest;
use url::Url;

use crate::{default_name, default_request, LaunchError, SessionStarter};

#[derive(Debug, Clone, PartialEq)]
pub enum UriRequest {
    Named {
        folder: Option<String>,
        name: String,
    },
    Config(LaunchRequest),
}

fn decode(text: &str) -> Result<String, LaunchError> {
    percent_decode_str(text)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| LaunchError::Uri("query is not valid UTF-8".to_string()))
}

/// Parse a launch URI into the session it asks for.
pub fn parse_uri(uri: &str) -> Result<UriRequest, LaunchError> {
    let url = Url::parse(uri).map_err(|err| LaunchError::Uri(err.to_string()))?;
    let query = url.query().unwrap_or_default();

    match url.path() {
        "/launch" => parse_named(query),
        "/launch/command" => parse_command(query).map(UriRequest::Config),
        "/launch/config" => parse_config(query).map(UriRequest::Config),
        other => Err(LaunchError::Uri(format!("unsupported path `{other}`"))),
    }
}

fn parse_named(query: &str) -> Result<UriRequest, LaunchError> {
    let mut folder = None;
    let mut name = None;
    for param in query.split([',', '&']).filter(|param| !param.is_empty()) {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        match decode(key)?.as_str() {
            "folder" => folder = Some(decode(value)?),
            "name" => name = Some(decode(value)?),
            _ => {}
        }
    }

    match name.filter(|name| !name.is_empty()) {
        Some(name) => Ok(UriRequest::Named {
            folder: folder.filter(|folder| !folder.is_empty()),
            name,
        }),
        None => Err(LaunchError::Uri(
            "unsupported combination of launch parameters".to_string(),
        )),
    }
}

fn parse_command(query: &str) -> Result<LaunchRequest, LaunchError> {
    let mut fragments: Vec<&str> = query.split('&').collect();
    let command_line = decode(fragments.pop().unwrap_or_default())?;

    let mut env = Map::new();
    for fragment in fragments {
        let fragment = decode(fragment)?;
        let Some((key, value)) = fragment.split_once('=') else {
            return Err(LaunchError::Uri(format!(
                "expected KEY=VALUE environment assignment, got `{fragment}`"
            )));
        };
        env.insert(key.to_string(), Value::String(value.to_string()));
    }

    let mut args = shell_words::split(&command_line)
        .map_err(|err| LaunchError::Uri(format!("invalid command line: {err}")))?
        .into_iter();
    let Some(program) = args.next() else {
        return Err(LaunchError::Uri("missing command line".to_string()));
    };

    let mut request = default_request();
    request.insert("program", Value::String(program));
    request.insert(
        "args",
        Value::Array(args.map(Value::String).collect()),
    );
    request.insert("env", Value::Object(env));
    default_name(&mut request);
    Ok(request)
}

fn parse_config(query: &str) -> Result<LaunchRequest, LaunchError> {
    let document = decode(query)?;
    let value: Value = serde_yaml::from_str(&document)?;
    let overrides = match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => {
            return Err(LaunchError::Uri(
                "launch configuration must be a mapping".to_string(),
            ))
        }
    };

    let mut request = default_request();
    for (key, value) in overrides {
        request.insert(key, value);
    }
    default_name(&mut request);
    Ok(request)
}

/// Parse `uri` and start the session it describes.
pub async fn handle_uri(uri: &str, starter: &dyn SessionStarter) -> Result<bool, LaunchError> {
    tracing::info!(target: "tether.launch", uri, "handling launch uri");
    match parse_uri(uri)? {
        UriRequest::Named { folder, name } => starter.start_named(folder.as_deref(), &name).await,
        UriRequest::Config(config) => starter.start(config, false).await,
    }
}
