use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::{BackendError, ExitReport, IsolationBackend, ProcessHandle, SpawnRequest};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[cfg(unix)]
const CONTAINER_DIR_MODE: u32 = 0o700;

#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    /// Directory holding one subdirectory per container.
    pub depot_path: PathBuf,
    /// Shell used to interpret command lines (`<shell> -c <command_line>`).
    pub shell: PathBuf,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            depot_path: std::env::temp_dir().join("warden").join("depot"),
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

/// Runs container commands as host processes confined to a per-container
/// working directory and process group.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    config: LocalBackendConfig,
}

impl LocalBackend {
    pub fn new(config: LocalBackendConfig) -> Self {
        Self { config }
    }

    pub fn container_dir(&self, handle: &str) -> PathBuf {
        self.config.depot_path.join(handle)
    }

    pub fn container_root(&self, handle: &str) -> PathBuf {
        self.container_dir(handle).join("root")
    }
}

#[async_trait]
impl IsolationBackend for LocalBackend {
    async fn provision(&self, handle: &str) -> Result<(), BackendError> {
        let root = self.container_root(handle);
        tokio::fs::create_dir_all(&root).await.map_err(|err| {
            BackendError::io(
                format!("failed to create container root {}", root.display()),
                err,
            )
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let dir = self.container_dir(handle);
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(CONTAINER_DIR_MODE))
                .await
                .map_err(|err| {
                    BackendError::io(
                        format!("failed to set permissions on {}", dir.display()),
                        err,
                    )
                })?;
        }

        debug!(handle, root = %root.display(), "provisioned container");
        Ok(())
    }

    async fn spawn(
        &self,
        handle: &str,
        request: SpawnRequest,
    ) -> Result<Box<dyn ProcessHandle>, BackendError> {
        let root = self.container_root(handle);
        tokio::fs::metadata(&root).await.map_err(|err| {
            BackendError::io(
                format!("container root {} is not available", root.display()),
                err,
            )
        })?;

        let stdout = open_sink(&request.stdout).await?;
        let stderr = open_sink(&request.stderr).await?;

        let mut command = Command::new(&self.config.shell);
        command
            .arg("-c")
            .arg(&request.command_line)
            .current_dir(&root)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("HOME", &root)
            .env("WARDEN_HANDLE", handle)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        // Own process group so terminate() reaches every descendant.
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| BackendError::Spawn {
            command: request.command_line.clone(),
            source,
        })?;

        let pid = child.id();
        debug!(handle, pid = ?pid, command = %request.command_line, "spawned process");

        Ok(Box::new(LocalProcess {
            child,
            pid,
            exited: None,
        }))
    }

    async fn teardown(&self, handle: &str) -> Result<(), BackendError> {
        let dir = self.container_dir(handle);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(handle, dir = %dir.display(), "removed container directory");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BackendError::io(
                format!("failed to remove container directory {}", dir.display()),
                err,
            )),
        }
    }
}

pub struct LocalProcess {
    child: Child,
    pid: Option<u32>,
    exited: Option<ExitReport>,
}

impl LocalProcess {
    fn reaped(&mut self, status: ExitStatus) -> ExitReport {
        let report = exit_report(status);
        self.exited = Some(report);
        report
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: libc::c_int) -> Result<(), BackendError> {
        match self.pid {
            // process_group(0) at spawn time makes the pgid equal to the pid.
            Some(pid) => signal_group(pid, signal),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<ExitReport, BackendError> {
        if let Some(report) = self.exited {
            return Ok(report);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|err| BackendError::io("failed to wait for process", err))?;
        Ok(self.reaped(status))
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), BackendError> {
        if self.exited.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        self.signal(libc::SIGTERM)?;
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.reaped(status);
                return Ok(());
            }
            Ok(Err(err)) => return Err(BackendError::io("failed to wait for process", err)),
            Err(_) => {
                warn!(pid = ?self.pid, grace = ?grace, "process outlived grace period, killing");
            }
        }

        #[cfg(unix)]
        self.signal(libc::SIGKILL)?;
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        let status = self
            .child
            .wait()
            .await
            .map_err(|err| BackendError::io("failed to reap killed process", err))?;
        self.reaped(status);
        Ok(())
    }
}

async fn open_sink(path: &Path) -> Result<File, BackendError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|err| {
            BackendError::io(
                format!("failed to create capture directory {}", parent.display()),
                err,
            )
        })?;
    }
    let file = tokio::fs::File::create(path).await.map_err(|err| {
        BackendError::io(
            format!("failed to create capture file {}", path.display()),
            err,
        )
    })?;
    Ok(file.into_std().await)
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> Result<(), BackendError> {
    let result = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(BackendError::Signal { pid, source: err });
        }
    }
    Ok(())
}

fn exit_report(status: ExitStatus) -> ExitReport {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return ExitReport {
                code: 128 + signal,
                signal: Some(signal),
            };
        }
    }

    ExitReport {
        code: status.code().unwrap_or(-1),
        signal: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn backend(dir: &Path) -> LocalBackend {
        LocalBackend::new(LocalBackendConfig {
            depot_path: dir.join("depot"),
            shell: PathBuf::from("/bin/sh"),
        })
    }

    fn request(dir: &Path, command_line: &str) -> SpawnRequest {
        SpawnRequest {
            command_line: command_line.to_string(),
            stdout: dir.join("captures").join("out"),
            stderr: dir.join("captures").join("err"),
        }
    }

    #[tokio::test]
    async fn spawn_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.provision("0000abcd").await.unwrap();

        let req = request(dir.path(), "echo out; echo err 1>&2; exit 7");
        let mut process = backend.spawn("0000abcd", req.clone()).await.unwrap();
        let report = process.wait().await.unwrap();

        assert_eq!(report.code, 7);
        assert_eq!(report.signal, None);
        assert_eq!(std::fs::read_to_string(&req.stdout).unwrap(), "out\n");
        assert_eq!(std::fs::read_to_string(&req.stderr).unwrap(), "err\n");
    }

    #[tokio::test]
    async fn commands_run_inside_container_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.provision("0000abcd").await.unwrap();

        let req = request(dir.path(), "pwd; echo $WARDEN_HANDLE");
        let mut process = backend.spawn("0000abcd", req.clone()).await.unwrap();
        assert!(process.wait().await.unwrap().success());

        let out = std::fs::read_to_string(&req.stdout).unwrap();
        let root = std::fs::canonicalize(backend.container_root("0000abcd")).unwrap();
        let mut lines = out.lines();
        assert_eq!(
            std::fs::canonicalize(lines.next().unwrap()).unwrap(),
            root
        );
        assert_eq!(lines.next(), Some("0000abcd"));
    }

    #[tokio::test]
    async fn spawn_requires_provisioned_container() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let result = backend.spawn("deadbeef", request(dir.path(), "true")).await;
        assert!(matches!(result, Err(BackendError::Io { .. })));
    }

    #[tokio::test]
    async fn terminate_stops_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.provision("0000abcd").await.unwrap();

        let mut process = backend
            .spawn("0000abcd", request(dir.path(), "sleep 30"))
            .await
            .unwrap();

        let started = Instant::now();
        process.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));

        let report = process.wait().await.unwrap();
        assert_eq!(report.signal, Some(libc::SIGTERM));
        assert_eq!(report.code, 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn terminate_escalates_when_term_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.provision("0000abcd").await.unwrap();

        let mut process = backend
            .spawn("0000abcd", request(dir.path(), "trap '' TERM; sleep 30"))
            .await
            .unwrap();
        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;

        process.terminate(Duration::from_millis(200)).await.unwrap();
        let report = process.wait().await.unwrap();
        assert_eq!(report.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn terminate_after_exit_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.provision("0000abcd").await.unwrap();

        let mut process = backend
            .spawn("0000abcd", request(dir.path(), "exit 3"))
            .await
            .unwrap();
        assert_eq!(process.wait().await.unwrap().code, 3);
        process.terminate(Duration::from_millis(10)).await.unwrap();
        assert_eq!(process.wait().await.unwrap().code, 3);
    }

    #[tokio::test]
    async fn teardown_removes_container_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.provision("0000abcd").await.unwrap();
        assert!(backend.container_root("0000abcd").is_dir());

        backend.teardown("0000abcd").await.unwrap();
        assert!(!backend.container_dir("0000abcd").exists());

        // Second teardown is harmless.
        backend.teardown("0000abcd").await.unwrap();
    }
}
