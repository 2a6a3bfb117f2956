//! `tether launch`: ask a running gateway to debug a command line in the current terminal.

use anyhow::Context;
use serde_json::Value;
use tether_launch::{LaunchEnvironment, TerminalId};

/// Describe `cmd` as it would run here: this directory, this environment, this terminal.
pub fn launch_environment(
    cmd: Vec<String>,
    config: Option<String>,
    token: Option<String>,
) -> anyhow::Result<LaunchEnvironment> {
    anyhow::ensure!(!cmd.is_empty(), "no command to launch");

    let cwd = std::env::current_dir().context("failed to determine the current directory")?;
    Ok(LaunchEnvironment {
        cmd,
        cwd: cwd.display().to_string(),
        env: std::env::vars_os()
            .filter_map(|(name, value)| {
                Some((name.into_string().ok()?, Value::String(value.into_string().ok()?)))
            })
            .collect(),
        terminal_id: terminal_id(),
        config,
        token,
    })
}

#[cfg(unix)]
fn terminal_id() -> Option<TerminalId> {
    // SAFETY: `ttyname` returns null or a pointer to a NUL-terminated static buffer, which is
    // copied out before anything else can call it.
    let name = unsafe {
        let ptr = libc::ttyname(libc::STDOUT_FILENO);
        if ptr.is_null() {
            return None;
        }
        std::ffi::CStr::from_ptr(ptr).to_str().ok()?.to_owned()
    };
    Some(TerminalId::Tty(name))
}

#[cfg(not(unix))]
fn terminal_id() -> Option<TerminalId> {
    Some(TerminalId::Pid(u64::from(std::process::id())))
}
