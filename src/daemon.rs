//! Socket-file takeover, pid file and daemonizing.
//!
//! ```text
//! socket path exists?
//!   no  ─────────────────────────────► bind
//!   yes ─ connect() answers?
//!           no  (stale)  ─ unlink ────► bind
//!           yes (live)   ─ force_socket or restart_mode?
//!                            yes ─ unlink ► bind
//!                            no  ─ start-up error
//! ```

use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::config::ServerConfig;
use crate::sys;

/// Make `config.socket_path` free for binding, following the takeover rules.
pub fn prepare_socket_path(config: &ServerConfig) -> Result<()> {
    let path = &config.socket_path;
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    if !meta.file_type().is_socket() {
        bail!("{} exists and is not a socket", path.display());
    }

    let live = UnixStream::connect(path).is_ok();
    if live && !(config.force_socket || config.restart_mode) {
        bail!(
            "another server is listening on {} (use --force-socket to take over)",
            path.display()
        );
    }
    if live {
        log::warn!("[daemon] taking over live socket {}", path.display());
    } else {
        log::info!("[daemon] removing stale socket {}", path.display());
    }
    fs::remove_file(path).with_context(|| format!("remove socket {}", path.display()))?;
    Ok(())
}

/// Bind the control socket, apply its permission bits and enable
/// credential passing. The listener is non-blocking.
pub fn bind_control_socket(config: &ServerConfig) -> Result<UnixListener> {
    prepare_socket_path(config)?;
    let path = &config.socket_path;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("create socket dir {}", dir.display()))?;
    }
    let listener =
        UnixListener::bind(path).with_context(|| format!("bind {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(config.socket_mode))
        .with_context(|| format!("chmod {:o} {}", config.socket_mode, path.display()))?;
    listener
        .set_nonblocking(true)
        .context("set control socket non-blocking")?;
    sys::enable_passcred(listener.as_raw_fd()).context("enable SO_PASSCRED")?;
    log::info!("[daemon] listening on {}", path.display());
    Ok(listener)
}

/// Write the current pid to `path`.
pub fn write_pid_file(path: &Path) -> Result<()> {
    let pid = std::process::id();
    fs::write(path, format!("{pid}\n"))
        .with_context(|| format!("write pid file {}", path.display()))?;
    log::info!("[daemon] wrote pid file {} (pid={})", path.display(), pid);
    Ok(())
}

/// Remove the socket and pid files. Missing files are not an error.
pub fn cleanup_on_shutdown(config: &ServerConfig) {
    for path in [&config.socket_path, &config.pid_path()] {
        match fs::remove_file(path) {
            Ok(()) => log::debug!("[daemon] removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("[daemon] could not remove {}: {}", path.display(), e),
        }
    }
}

/// Detach from the terminal. Must run before any thread is spawned.
pub fn daemonize() -> Result<()> {
    sys::daemonize().context("daemon(3)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_in(dir: &Path) -> ServerConfig {
        ServerConfig {
            socket_path: dir.join("ctl.sock"),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn binds_fresh_path_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let _listener = bind_control_socket(&config).unwrap();
        let mode = fs::metadata(&config.socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        drop(UnixListener::bind(&config.socket_path).unwrap());
        assert!(config.socket_path.exists());
        bind_control_socket(&config).unwrap();
    }

    #[test]
    fn live_socket_needs_force() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        let _live = UnixListener::bind(&config.socket_path).unwrap();

        let err = prepare_socket_path(&config).unwrap_err();
        assert!(err.to_string().contains("another server"));

        config.force_socket = true;
        prepare_socket_path(&config).unwrap();
        assert!(!config.socket_path.exists());
    }

    #[test]
    fn regular_file_is_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        fs::write(&config.socket_path, b"data").unwrap();
        assert!(prepare_socket_path(&config).is_err());
        assert!(config.socket_path.exists());
    }

    #[test]
    fn pid_file_holds_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("ctl.pid");
        write_pid_file(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, format!("{}\n", std::process::id()));
    }

    #[test]
    fn cleanup_removes_socket_and_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let _listener = bind_control_socket(&config).unwrap();
        write_pid_file(&config.pid_path()).unwrap();
        cleanup_on_shutdown(&config);
        assert!(!config.socket_path.exists());
        assert!(!config.pid_path().exists());
    }

    #[test]
    fn cleanup_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        cleanup_on_shutdown(&config);
    }
}
