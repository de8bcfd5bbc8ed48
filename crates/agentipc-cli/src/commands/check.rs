use agentipc_core::IpcConfig;
use agentipc_transport::{policy, RealFileOps, SocketPathPolicy, SOCKET_PREFIX};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Socket directory report.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub socket_dir: PathBuf,
    pub dir_mode: &'static str,
    pub ipc_type: &'static str,
    pub exists: bool,
    pub secure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Server names with a socket file in the directory.
    pub servers: Vec<String>,
}

impl CheckReport {
    pub fn collect(config: &IpcConfig) -> Self {
        let mut report = Self {
            socket_dir: config.socket_dir.clone(),
            dir_mode: config.dir_mode.as_str(),
            ipc_type: config.ipc_type.as_str(),
            exists: false,
            secure: false,
            error: None,
            servers: Vec::new(),
        };

        let dir = match policy::resolve_directory(&config.socket_dir) {
            Ok(dir) => dir,
            Err(e) => {
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.socket_dir.clone_from(&dir);
        report.exists = std::fs::symlink_metadata(&dir).is_ok();
        if !report.exists {
            // Created with the right mode on the next `serve`
            report.secure = true;
            return report;
        }

        let policy = SocketPathPolicy::new(config.dir_mode, Arc::new(RealFileOps));
        match policy.verify_directory_security(&dir) {
            Ok(()) => {
                report.secure = true;
                report.servers = list_servers(&dir);
            }
            Err(e) => report.error = Some(e.to_string()),
        }
        report
    }
}

fn list_servers(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(SOCKET_PREFIX))
                .map(str::to_string)
        })
        .collect();
    names.sort();
    names
}

/// Run the check command.
///
/// Exits non-zero when the directory exists but fails the security checks.
pub fn run(config: &IpcConfig, json: bool) -> Result<()> {
    let report = CheckReport::collect(config);

    if json {
        println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
    } else {
        print_human(&report);
    }

    if !report.secure {
        std::process::exit(1);
    }
    Ok(())
}

fn print_human(report: &CheckReport) {
    println!("Socket directory: {}", report.socket_dir.display());
    println!("Transport:        {}", report.ipc_type);
    println!("Required mode:    {}", report.dir_mode);

    if !report.exists {
        println!("Status:           absent (created on serve)");
        return;
    }

    match &report.error {
        Some(error) => println!("Status:           INSECURE: {error}"),
        None => println!("Status:           ok"),
    }
    if !report.servers.is_empty() {
        println!("Servers:          {}", report.servers.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentipc_core::DirMode;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn test_absent_directory_is_fine() {
        let tmp = tempdir().unwrap();
        let report = CheckReport::collect(&IpcConfig::new(tmp.path().join("ipc")));
        assert!(!report.exists);
        assert!(report.secure);
        assert!(report.error.is_none());
    }

    #[test]
    fn test_reports_servers_in_secure_directory() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("ipc");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();
        std::fs::write(dir.join("sock-beta"), b"").unwrap();
        std::fs::write(dir.join("sock-alpha"), b"").unwrap();
        std::fs::write(dir.join("notes.txt"), b"").unwrap();

        let report = CheckReport::collect(&IpcConfig::new(&dir));
        assert!(report.exists);
        assert!(report.secure);
        assert_eq!(report.servers, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_wrong_mode_is_insecure() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("ipc");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();

        let report =
            CheckReport::collect(&IpcConfig::new(&dir).with_dir_mode(DirMode::OwnerGroup));
        assert!(!report.secure);
        assert!(report.error.unwrap().contains("mode"));
    }
}
