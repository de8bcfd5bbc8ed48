use std::path::PathBuf;

/// Environment variable overriding the socket directory.
///
/// Also exported to client processes so they can find the agent's sockets.
pub const SOCKET_DIR_ENV: &str = "AGENTIPC_SOCKET_DIR";

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "AGENTIPC_CONFIG";

const APP_DIR: &str = "agentipc";

/// Get the socket directory for the agent.
///
/// Priority:
/// 1. `AGENTIPC_SOCKET_DIR` if set
/// 2. `$XDG_RUNTIME_DIR/agentipc` where a runtime directory exists
/// 3. `<tmp>/agentipc` as fallback
#[must_use]
pub fn default_socket_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(SOCKET_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    dirs_next::runtime_dir().map_or_else(
        || std::env::temp_dir().join(APP_DIR),
        |p| p.join(APP_DIR),
    )
}

/// Get the config file path.
///
/// Respects `AGENTIPC_CONFIG`, otherwise `{config_dir}/agentipc/ipc.json`.
#[must_use]
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    dirs_next::config_dir()
        .map_or_else(|| PathBuf::from(".agentipc"), |p| p.join(APP_DIR))
        .join("ipc.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_socket_dir_env_override() {
        std::env::set_var(SOCKET_DIR_ENV, "/tmp/agentipc-test-dir");
        assert_eq!(default_socket_dir(), PathBuf::from("/tmp/agentipc-test-dir"));
        std::env::remove_var(SOCKET_DIR_ENV);
    }

    #[test]
    #[serial]
    fn test_socket_dir_default_ends_with_app_dir() {
        std::env::remove_var(SOCKET_DIR_ENV);
        let dir = default_socket_dir();
        assert!(dir.ends_with(APP_DIR));

        if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
            if !runtime_dir.is_empty() && cfg!(target_os = "linux") {
                assert!(dir.starts_with(&runtime_dir));
            }
        }
    }

    #[test]
    #[serial]
    fn test_config_path_env_override() {
        std::env::set_var(CONFIG_PATH_ENV, "/etc/agentipc/custom.json");
        assert_eq!(
            default_config_path(),
            PathBuf::from("/etc/agentipc/custom.json")
        );
        std::env::remove_var(CONFIG_PATH_ENV);

        assert!(default_config_path().ends_with("ipc.json"));
    }
}
