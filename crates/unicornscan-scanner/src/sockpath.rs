//! Runtime socket path discovery
//!
//! Local drones rendezvous over Unix-domain sockets. Root keeps the
//! traditional system directory; unprivileged runs prefer
//! `$XDG_RUNTIME_DIR` (per-user, cleaned up on logout) and fall back to a
//! UID-suffixed directory under `/tmp`. The directory is created with mode
//! 0755 for root and 0700 otherwise, and must already belong to us if it
//! exists.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::debug;
use unicornscan_core::{Error, Result};

/// Directory used when running as root.
const ROOT_SOCKET_DIR: &str = "/var/unicornscan";

/// Decide the socket directory from uid and environment. Pure so the choice
/// order is testable; [`socket_dir`] applies it to the real process.
pub fn resolve_socket_dir(uid: u32, xdg_runtime_dir: Option<&str>) -> (PathBuf, u32) {
    if uid == 0 {
        return (PathBuf::from(ROOT_SOCKET_DIR), 0o755);
    }

    if let Some(xdg) = xdg_runtime_dir {
        if !xdg.is_empty() && Path::new(xdg).is_dir() {
            return (Path::new(xdg).join("unicornscan"), 0o700);
        }
    }

    (PathBuf::from(format!("/tmp/unicornscan-{}", uid)), 0o700)
}

/// Create (if needed) and validate the directory chosen by
/// [`resolve_socket_dir`].
fn ensure_dir(dir: &Path, mode: u32, uid: u32) -> Result<()> {
    match fs::metadata(dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(Error::Config(format!(
                    "{} exists but is not a directory",
                    dir.display()
                )));
            }
            if meta.uid() != uid {
                return Err(Error::Config(format!(
                    "socket directory {} is owned by uid {}, not us ({})",
                    dir.display(),
                    meta.uid(),
                    uid
                )));
            }
            Ok(())
        }
        Err(_) => {
            fs::DirBuilder::new()
                .mode(mode)
                .create(dir)
                .map_err(|e| {
                    Error::Config(format!(
                        "cannot create socket directory {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
            debug!(dir = %dir.display(), mode = format!("{:o}", mode), "socket directory created");
            Ok(())
        }
    }
}

/// The socket directory for this process, created on first use.
pub fn socket_dir() -> Result<PathBuf> {
    let uid = nix::unistd::getuid().as_raw();
    let xdg = std::env::var("XDG_RUNTIME_DIR").ok();
    let (dir, mode) = resolve_socket_dir(uid, xdg.as_deref());
    ensure_dir(&dir, mode, uid)?;
    Ok(dir)
}

/// Drone URI for the local sender socket.
pub fn sender_uri() -> Result<String> {
    Ok(format!("unix:{}/send", socket_dir()?.display()))
}

/// Drone URI for the local listener socket.
pub fn listener_uri() -> Result<String> {
    Ok(format!("unix:{}/listen", socket_dir()?.display()))
}

/// Remove stale sockets left behind by a previous run.
pub fn cleanup_stale_sockets() -> Result<()> {
    let dir = socket_dir()?;
    for name in ["send", "listen"] {
        let path = dir.join(name);
        if let Ok(meta) = fs::symlink_metadata(&path) {
            if meta.file_type().is_socket() {
                debug!(path = %path.display(), "removing stale socket");
                let _ = fs::remove_file(&path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_uses_system_dir() {
        let (dir, mode) = resolve_socket_dir(0, Some("/run/user/0"));
        assert_eq!(dir, PathBuf::from("/var/unicornscan"));
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn test_xdg_preferred_when_valid() {
        // /tmp certainly exists, standing in for a runtime dir.
        let (dir, mode) = resolve_socket_dir(1000, Some("/tmp"));
        assert_eq!(dir, PathBuf::from("/tmp/unicornscan"));
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn test_missing_xdg_falls_back_to_tmp() {
        let (dir, mode) = resolve_socket_dir(1000, Some("/definitely/not/a/dir"));
        assert_eq!(dir, PathBuf::from("/tmp/unicornscan-1000"));
        assert_eq!(mode, 0o700);

        let (dir, _) = resolve_socket_dir(1000, None);
        assert_eq!(dir, PathBuf::from("/tmp/unicornscan-1000"));

        let (dir, _) = resolve_socket_dir(1000, Some(""));
        assert_eq!(dir, PathBuf::from("/tmp/unicornscan-1000"));
    }

    #[test]
    fn test_socket_dir_is_usable() {
        // Whatever environment the tests run in, the resolved directory must
        // come back created and owned by us.
        let dir = socket_dir().unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn test_uris_share_the_dir() {
        let send = sender_uri().unwrap();
        let listen = listener_uri().unwrap();
        assert!(send.starts_with("unix:"));
        assert!(send.ends_with("/send"));
        assert!(listen.ends_with("/listen"));
        let send_dir = send.trim_start_matches("unix:").trim_end_matches("/send");
        let listen_dir = listen
            .trim_start_matches("unix:")
            .trim_end_matches("/listen");
        assert_eq!(send_dir, listen_dir);
    }
}
