use indexmap::IndexMap;
use tether_config::expand::{expand_str, ExpandError};

/// Variables removed from the inherited environment unless the caller sets them explicitly.
/// A stray Python installation would otherwise be picked up by the debugger's scripting engine,
/// and `CODELLDB_STARTUP` runs a command in every adapter started from this shell.
pub const SCRUBBED_VARIABLES: &[&str] = &["PYTHONHOME", "PYTHONPATH", "CODELLDB_STARTUP"];

/// An ordered set of environment variables.
///
/// With `case_insensitive`, names differing only in case refer to the same variable and the
/// spelling first inserted is the one passed to the child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    case_insensitive: bool,
    // normalized name -> (name as spelled, value)
    vars: IndexMap<String, (String, String)>,
}

impl Environment {
    pub fn new(case_insensitive: bool) -> Self {
        Self {
            case_insensitive,
            vars: IndexMap::new(),
        }
    }

    /// Snapshot of the current process environment.
    pub fn from_process(case_insensitive: bool) -> Self {
        let mut env = Self::new(case_insensitive);
        env.extend(std::env::vars());
        env
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    fn key(&self, name: &str) -> String {
        if self.case_insensitive {
            name.to_uppercase()
        } else {
            name.to_string()
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(&self.key(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(&self.key(name))
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let key = self.key(&name);
        match self.vars.entry(key) {
            indexmap::map::Entry::Occupied(mut slot) => slot.get_mut().1 = value,
            indexmap::map::Entry::Vacant(slot) => {
                slot.insert((name, value));
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let key = self.key(name);
        self.vars.shift_remove(&key).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl Extend<(String, String)> for Environment {
    fn extend<T: IntoIterator<Item = (String, String)>>(&mut self, iter: T) {
        for (name, value) in iter {
            self.insert(name, value);
        }
    }
}

/// Build the adapter's environment: `base` minus [`SCRUBBED_VARIABLES`], plus `overrides`.
///
/// Override values may reference `${env:NAME}`, looked up in `base` (unset expands to an empty
/// string). Any other placeholder is a configuration error.
pub fn adapter_environment(
    base: &Environment,
    overrides: &IndexMap<String, String>,
) -> Result<Environment, ExpandError> {
    let mut env = base.clone();

    for name in SCRUBBED_VARIABLES {
        let explicit = overrides.keys().any(|key| env.key(key) == env.key(name));
        if !explicit {
            env.remove(name);
        }
    }

    for (name, value) in overrides {
        let value = expand_str(value, &mut |ty, key| match ty {
            Some("env") => Ok(Some(base.get(key).unwrap_or_default().to_string())),
            Some(ty) => Err(ExpandError::UnknownType {
                placeholder: format!("${{{ty}:{key}}}"),
            }),
            None => Err(ExpandError::UnknownType {
                placeholder: format!("${{{key}}}"),
            }),
        })?;
        env.insert(name.clone(), value);
    }

    Ok(env)
}
