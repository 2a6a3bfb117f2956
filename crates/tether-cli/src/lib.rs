//! Pieces of the `tether` binary that its integration tests drive directly.

use std::path::PathBuf;

use tether_config::TetherConfig;

pub mod launcher;
pub mod proxy;
pub mod session;

pub use crate::session::HeadlessStarter;

/// Load the config from `cli_path`, falling back to `TETHER_CONFIG`. A missing path yields
/// defaults; a file that cannot be loaded is reported on stderr and defaults are used.
pub fn load_config(cli_path: Option<PathBuf>) -> TetherConfig {
    let Some(path) = TetherConfig::discover_path(cli_path.as_deref()) else {
        return TetherConfig::default();
    };

    match TetherConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "tether: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            TetherConfig::default()
        }
    }
}
