use std::path::PathBuf;

/// Environment override for the data directory.
pub const DATA_DIR_ENV: &str = "LUMEN_DATA_DIR";

/// Root data directory for lumen.
///
/// Holds the persistent registry and the optional `config.toml`.
///
/// - `$LUMEN_DATA_DIR` when set
/// - Linux: `~/.lumen/`
/// - macOS: `~/Library/Application Support/lumen/`
/// - Windows: `%LOCALAPPDATA%\lumen\`
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("lumen");
        }
    }

    #[cfg(windows)]
    {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(local).join("lumen");
        }
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".lumen");
        }
    }

    PathBuf::from(".lumen")
}

pub const REGISTRY_FILE: &str = "registry.json";
pub const CONFIG_FILE: &str = "config.toml";

/// Persistent controller/group registry file.
pub fn registry_path() -> PathBuf {
    data_dir().join(REGISTRY_FILE)
}

/// Optional configuration file.
pub fn config_path() -> PathBuf {
    data_dir().join(CONFIG_FILE)
}
