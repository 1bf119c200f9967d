//! Locating the control sockets of running host processes.
//!
//! Every host process serves `host-{pid}.sock` inside one runtime
//! directory:
//! - `$XDG_RUNTIME_DIR/bridgeme/` if XDG_RUNTIME_DIR is set
//! - `/tmp/bridgeme-$UID/` otherwise
//!
//! Sockets whose process is gone are stale and get removed on discovery.

use std::fs;
use std::path::{Path, PathBuf};

const SOCKET_PREFIX: &str = "host-";
const SOCKET_SUFFIX: &str = ".sock";

/// A discovered host control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSocket {
    /// Owning host process id.
    pub pid: u32,
    /// Socket file.
    pub path: PathBuf,
}

/// Directory holding the host sockets.
pub fn socket_dir() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => PathBuf::from(runtime_dir).join("bridgeme"),
        _ => {
            let uid = fs::metadata("/proc/self").map(|m| m.uid()).unwrap_or(0);
            PathBuf::from(format!("/tmp/bridgeme-{}", uid))
        }
    }
}

/// Socket path of the host process `pid` inside `dir`.
pub fn host_socket_path_in(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("{}{}{}", SOCKET_PREFIX, pid, SOCKET_SUFFIX))
}

/// Socket path of the host process `pid`.
pub fn host_socket_path(pid: u32) -> PathBuf {
    host_socket_path_in(&socket_dir(), pid)
}

/// Extracts the pid from a `host-{pid}.sock` file name.
pub fn parse_socket_pid(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix(SOCKET_PREFIX)?
        .strip_suffix(SOCKET_SUFFIX)?
        .parse()
        .ok()
}

/// Live host sockets in the default directory, ordered by pid.
pub fn discover_hosts() -> Vec<HostSocket> {
    discover_hosts_in(&socket_dir())
}

/// Live host sockets in `dir`, ordered by pid. Stale sockets are removed.
pub fn discover_hosts_in(dir: &Path) -> Vec<HostSocket> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut hosts: Vec<HostSocket> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter_map(|path| parse_socket_pid(&path).map(|pid| HostSocket { pid, path }))
        .filter(|host| {
            if is_process_running(host.pid) {
                true
            } else {
                tracing::debug!(pid = host.pid, path = %host.path.display(), "Removing stale host socket");
                cleanup_stale_socket(&host.path);
                false
            }
        })
        .collect();

    hosts.sort_by_key(|host| host.pid);
    hosts
}

/// Check if a process with the given PID is running.
///
/// On Linux, this checks if `/proc/{pid}/stat` exists. Elsewhere it
/// probes the process with a null signal.
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }
}

fn cleanup_stale_socket(path: &Path) {
    let _ = fs::remove_file(path);
}
