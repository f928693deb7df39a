//! Module for searching for hidpath config files

use std::path::PathBuf;

/// Base system fallback path to use if one cannot be found with XDG
const FALLBACK_BASE_PATH: &str = "/usr/share/hidpath";

/// Returns the base path for configuration data
pub fn get_base_path() -> PathBuf {
    let Ok(base_dirs) = xdg::BaseDirectories::with_prefix("hidpath") else {
        log::warn!("Unable to determine config base path. Using fallback path.");
        return PathBuf::from(FALLBACK_BASE_PATH);
    };

    // Get the data directories in preference order
    let data_dirs = base_dirs.get_data_dirs();
    for dir in data_dirs {
        if dir.exists() {
            return dir;
        }
    }

    log::warn!("Config base path not found. Using fallback path.");
    PathBuf::from(FALLBACK_BASE_PATH)
}

/// Returns the list of config file locations in load order.
/// E.g. ["/etc/hidpath/config.yaml", "/usr/share/hidpath/config.yaml"]
pub fn get_config_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/etc/hidpath/config.yaml"),
        get_base_path().join("config.yaml"),
    ]
}
