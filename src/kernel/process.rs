//! Kernel process handle built on `tokio::process`.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::io::{AsyncKernelReader, AsyncKernelWriter, KernelOutput, OutputStream};
use super::{IsolationSpec, KernelSpec, ProcessId, ProcessState};
use crate::error::KnobooError;
use crate::Result;

/// Capacity of the stdin frame queue.
const INPUT_QUEUE: usize = 64;

/// Capacity of the merged stdout/stderr line queue.
const OUTPUT_QUEUE: usize = 256;

/// Channel ends for talking to a running kernel.
pub struct KernelIo {
    /// Frames written to the kernel's stdin, in send order.
    pub input: mpsc::Sender<Vec<u8>>,
    /// Lines read from stdout and stderr. Closes once both streams hit EOF.
    pub output: mpsc::Receiver<KernelOutput>,
}

/// One external kernel process.
pub struct KernelProcess {
    id: ProcessId,
    pid: Option<u32>,
    command: String,
    state: Mutex<ProcessState>,
    child: tokio::sync::Mutex<Child>,
    started_at: Instant,
}

impl KernelProcess {
    /// Spawn a kernel process and start its I/O pumps.
    ///
    /// Must be called from within a tokio runtime. Spawn failures are
    /// reported as [`KnobooError::Spawn`] and never retried here.
    pub fn start(spec: &KernelSpec, isolation: &IsolationSpec) -> Result<(Self, KernelIo)> {
        let id = ProcessId::new();
        let mut state = ProcessState::Starting;

        let mut cmd = build_command(spec, isolation)?;
        let mut child = cmd
            .spawn()
            .map_err(|e| KnobooError::Spawn(format!("{}: {}", spec.command, e)))?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(KnobooError::Spawn(format!(
                    "{}: stdio pipes unavailable",
                    spec.command
                )));
            }
        };

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE);

        tokio::spawn(AsyncKernelWriter::new(stdin, input_rx).run());
        tokio::spawn(AsyncKernelReader::new(stdout, OutputStream::Stdout, output_tx.clone()).run());
        tokio::spawn(AsyncKernelReader::new(stderr, OutputStream::Stderr, output_tx).run());

        state.transition_to(ProcessState::Running)?;
        let pid = child.id();
        info!(process = %id, pid = pid.unwrap_or(0), command = %spec.command, "kernel started");

        let process = Self {
            id,
            pid,
            command: spec.command.clone(),
            state: Mutex::new(state),
            child: tokio::sync::Mutex::new(child),
            started_at: Instant::now(),
        };
        let io = KernelIo {
            input: input_tx,
            output: output_rx,
        };
        Ok((process, io))
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// OS process ID, if the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> ProcessState {
        self.state.lock().map(|s| *s).unwrap_or(ProcessState::Failed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Move to `target` if the lifecycle allows it.
    ///
    /// Returns `true` when this call performed the transition, so exactly
    /// one caller observes a given death or shutdown.
    pub fn transition(&self, target: ProcessState) -> bool {
        match self.state.lock() {
            Ok(mut state) => state.transition_to(target).is_ok(),
            Err(_) => false,
        }
    }

    /// Check whether the OS process is still running.
    pub async fn is_alive(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(process = %self.id, %status, "kernel has exited");
                false
            }
            Err(e) => {
                warn!(process = %self.id, "failed to poll kernel status: {}", e);
                false
            }
        }
    }

    /// Ask the kernel to exit, force-killing it after `grace`.
    ///
    /// Returns the final state: `Stopped` when this call shut the process
    /// down, `Failed` when it had already died on its own.
    pub async fn stop(&self, grace: Duration) -> ProcessState {
        if self.state().is_terminal() {
            return self.state();
        }

        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            info!(process = %self.id, %status, "kernel exited before stop");
            self.transition(ProcessState::Failed);
            return self.state();
        }

        request_exit(&mut child, self.pid);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(process = %self.id, %status, "kernel exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(process = %self.id, "error waiting for kernel: {}", e);
                if let Err(e) = child.kill().await {
                    warn!(process = %self.id, "failed to kill kernel: {}", e);
                }
            }
            Err(_) => {
                warn!(
                    process = %self.id,
                    "kernel did not exit within {:?}, forcing kill", grace
                );
                if let Err(e) = child.kill().await {
                    warn!(process = %self.id, "failed to kill kernel: {}", e);
                    self.transition(ProcessState::Failed);
                    return self.state();
                }
            }
        }

        self.transition(ProcessState::Stopped);
        self.state()
    }

    /// Force-kill the process and mark it `Failed`.
    ///
    /// Used when the kernel is already considered dead, e.g. its output
    /// closed while the OS process lingers.
    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Ok(None) = child.try_wait() {
            if let Err(e) = child.kill().await {
                warn!(process = %self.id, "failed to kill kernel: {}", e);
            }
        }
        self.transition(ProcessState::Failed);
    }
}

impl std::fmt::Debug for KernelProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("state", &self.state())
            .finish()
    }
}

/// Send the polite termination request.
#[cfg(unix)]
fn request_exit(child: &mut Child, pid: Option<u32>) {
    match pid.and_then(|p| libc::pid_t::try_from(p).ok()) {
        Some(pid) => {
            // SAFETY: plain syscall on a pid we spawned and have not reaped.
            if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                debug!("SIGTERM failed: {}", std::io::Error::last_os_error());
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

fn build_command(spec: &KernelSpec, isolation: &IsolationSpec) -> Result<Command> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(path) = spec.python_path()? {
        cmd.env("PYTHONPATH", path);
    }

    apply_isolation(&mut cmd, spec, isolation)?;
    Ok(cmd)
}

#[cfg(unix)]
fn apply_isolation(cmd: &mut Command, spec: &KernelSpec, isolation: &IsolationSpec) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Some(root) = &spec.root else {
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(gid) = isolation.gid {
            cmd.gid(gid);
        }
        if let Some(uid) = isolation.uid {
            cmd.uid(uid);
        }
        return Ok(());
    };

    // The jail must be entered before privileges are dropped, so both
    // happen in the pre-exec hook instead of through uid()/gid().
    let root = CString::new(root.as_os_str().as_bytes())
        .map_err(|_| KnobooError::Spawn("root path contains NUL".into()))?;
    let dir = match &spec.working_dir {
        Some(dir) => CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| KnobooError::Spawn("working dir contains NUL".into()))?,
        None => CString::new("/").map_err(|_| KnobooError::Spawn("bad root dir".into()))?,
    };
    let (uid, gid) = (isolation.uid, isolation.gid);

    // SAFETY: the hook only calls async-signal-safe libc functions and
    // does not allocate.
    unsafe {
        cmd.pre_exec(move || enter_jail(&root, &dir, uid, gid));
    }
    Ok(())
}

#[cfg(unix)]
fn enter_jail(
    root: &std::ffi::CStr,
    dir: &std::ffi::CStr,
    uid: Option<u32>,
    gid: Option<u32>,
) -> std::io::Result<()> {
    // SAFETY: pointers come from live CStrs; called in the forked child.
    unsafe {
        if libc::chroot(root.as_ptr()) != 0 || libc::chdir(dir.as_ptr()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if let Some(gid) = gid {
            if libc::setgid(gid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        if let Some(uid) = uid {
            if libc::setuid(uid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_isolation(cmd: &mut Command, spec: &KernelSpec, isolation: &IsolationSpec) -> Result<()> {
    if spec.root.is_some() || isolation.is_isolated() {
        return Err(KnobooError::Spawn(
            "process isolation is only supported on unix".into(),
        ));
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::kernel::Framing;

    fn cat() -> KernelSpec {
        KernelSpec::new("/bin/cat").framing(Framing::Raw)
    }

    #[tokio::test]
    async fn test_start_and_echo() {
        let (process, mut io) = KernelProcess::start(&cat(), &IsolationSpec::none()).unwrap();
        assert_eq!(process.state(), ProcessState::Running);
        assert!(process.pid().is_some());
        assert!(process.is_alive().await);

        io.input.send(b"hello kernel\n".to_vec()).await.unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), io.output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text(), "hello kernel");
        assert_eq!(line.stream, OutputStream::Stdout);

        assert_eq!(process.stop(Duration::from_secs(2)).await, ProcessState::Stopped);
        assert!(!process.is_alive().await);
    }

    #[tokio::test]
    async fn test_spawn_error_for_missing_binary() {
        let spec = KernelSpec::new("/nonexistent/knoboo-kernel");
        let result = KernelProcess::start(&spec, &IsolationSpec::none());
        assert!(matches!(result, Err(KnobooError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let spec = KernelSpec::new("/bin/sh")
            .arg("-c")
            .arg("echo oops 1>&2")
            .framing(Framing::Raw);
        let (_process, mut io) = KernelProcess::start(&spec, &IsolationSpec::none()).unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), io.output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.stream, OutputStream::Stderr);
        assert_eq!(line.text(), "oops");
    }

    #[tokio::test]
    async fn test_exited_process_reports_failed_on_stop() {
        let spec = KernelSpec::new("/bin/sh").arg("-c").arg("exit 3");
        let (process, mut io) = KernelProcess::start(&spec, &IsolationSpec::none()).unwrap();

        // Output closes once the process is gone.
        let _ = tokio::time::timeout(Duration::from_secs(5), io.output.recv()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!process.is_alive().await);
        assert_eq!(process.stop(Duration::from_secs(1)).await, ProcessState::Failed);
    }

    #[tokio::test]
    async fn test_stop_forces_kill_after_grace() {
        let spec = KernelSpec::new("/bin/sh")
            .arg("-c")
            .arg("trap '' TERM; while true; do sleep 1; done");
        let (process, _io) = KernelProcess::start(&spec, &IsolationSpec::none()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let state = process.stop(Duration::from_millis(200)).await;
        assert_eq!(state, ProcessState::Stopped);
        assert!(!process.is_alive().await);
    }

    #[tokio::test]
    async fn test_python_path_exported() {
        let spec = KernelSpec::new("/bin/sh")
            .arg("-c")
            .arg("echo $PYTHONPATH")
            .search_path("/opt/knoboo");
        let (_process, mut io) = KernelProcess::start(&spec, &IsolationSpec::none()).unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), io.output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text(), "/opt/knoboo");
    }

    #[tokio::test]
    async fn test_kill_marks_failed() {
        let (process, _io) = KernelProcess::start(&cat(), &IsolationSpec::none()).unwrap();
        process.kill().await;
        assert_eq!(process.state(), ProcessState::Failed);
        assert!(!process.is_alive().await);
    }
}
