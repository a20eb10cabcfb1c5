//! Process utility functions for cross-platform command execution
//!
//! Spawning shell commands consistently across platforms, and terminating
//! processes owned by a session (graceful signal, grace period, hard kill).

use std::time::Duration;
use tokio::process::Command;

/// Windows creation flag to hide the console window
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// How often a terminating process is polled during the grace period
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configure a Command to hide the console window on Windows
#[cfg(windows)]
pub fn hide_console_window(cmd: &mut Command) {
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
pub fn hide_console_window(_cmd: &mut Command) {}

/// Create a shell command configured for the current platform
///
/// On Windows, uses `cmd /C` with hidden console window.
/// On Unix, uses `sh -c`.
pub fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        hide_console_window(&mut cmd);
        cmd
    }

    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Whether a process with `pid` still exists
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), None).is_ok()
}

#[cfg(windows)]
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// Terminate `pid`: graceful signal, wait up to `grace`, then force-kill.
///
/// Returns `true` if the process had to be force-killed.
#[cfg(unix)]
pub async fn terminate_process(pid: u32, grace: Duration) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let target = Pid::from_raw(raw);

    if let Err(e) = kill(target, Signal::SIGTERM) {
        tracing::debug!(pid, "SIGTERM failed (process likely gone): {}", e);
        return false;
    }

    if wait_for_exit(pid, grace).await {
        return false;
    }

    tracing::warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
    let _ = kill(target, Signal::SIGKILL);
    true
}

#[cfg(windows)]
pub async fn terminate_process(pid: u32, grace: Duration) -> bool {
    let pid_arg = pid.to_string();
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid_arg, "/T"])
        .output();

    if wait_for_exit(pid, grace).await {
        return false;
    }

    tracing::warn!(pid, "Process did not exit, forcing termination");
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid_arg, "/T", "/F"])
        .output();
    true
}

async fn wait_for_exit(pid: u32, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    !process_alive(pid)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn test_shell_command_runs() {
        let output = shell_command("echo hello")
            .stdout(Stdio::piped())
            .output()
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn test_terminate_process_graceful() {
        let mut child = shell_command("sleep 30").spawn().unwrap();
        let pid = child.id().unwrap();

        // Reap concurrently so the pid disappears once the signal lands
        let waiter = tokio::spawn(async move { child.wait().await });

        let forced = terminate_process(pid, Duration::from_secs(3)).await;
        assert!(!forced);

        let status = waiter.await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_terminate_process_forces_after_grace() {
        let mut child = shell_command("trap '' TERM; sleep 5").spawn().unwrap();
        let pid = child.id().unwrap();
        let waiter = tokio::spawn(async move { child.wait().await });

        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        let forced = terminate_process(pid, Duration::from_millis(300)).await;
        assert!(forced);

        let status = waiter.await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_terminate_missing_process() {
        assert!(!terminate_process(u32::MAX, Duration::from_millis(10)).await);
    }
}
