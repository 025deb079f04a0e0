use std::io;
use std::process::ExitStatus;
use tokio::process::Child;
use tokio::time::{timeout, Duration};

#[cfg(unix)]
pub use libc::{SIGKILL, SIGTERM};

/// Sends `signal` to the process group led by `pid`, falling back to the single
/// process when it does not lead a group. Returns false when nothing received it.
#[cfg(unix)]
pub fn signal_process_group(pid: u32, signal: libc::c_int) -> bool {
    let pid_t = pid as libc::pid_t;
    if pid_t <= 0 {
        return false;
    }

    if unsafe { libc::kill(-pid_t, signal) } == 0 {
        return true;
    }

    if unsafe { libc::kill(pid_t, signal) } == 0 {
        return true;
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => log::debug!("Process {pid} already gone before signal {signal}"),
        Some(libc::EPERM) => log::warn!("Insufficient permissions to signal process {pid}"),
        _ => log::warn!("Failed to send signal {signal} to process {pid}: {err}"),
    }
    false
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    unsafe {
        if libc::kill(pid as libc::pid_t, 0) == 0 {
            true
        } else {
            matches!(io::Error::last_os_error().raw_os_error(), Some(libc::EPERM))
        }
    }
}

/// Two-phase stop: SIGTERM to the child's group, wait up to `grace`, then SIGKILL.
/// Resolves only once the child has been reaped.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        return child.wait().await;
    };

    #[cfg(unix)]
    {
        log::debug!("Sending SIGTERM to process group {pid}");
        signal_process_group(pid, SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            log::debug!("Process {pid} ignored SIGTERM for {grace:?}, escalating to SIGKILL");
            force_kill(child);
            child.wait().await
        }
    }
}

/// Immediate, non-blocking kill of the child and its process group.
pub fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            signal_process_group(pid, SIGKILL);
        }
    }
    if let Err(err) = child.start_kill() {
        log::debug!("start_kill on child failed: {err}");
    }
}
