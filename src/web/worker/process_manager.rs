//! Worker process lifecycle management.
//!
//! Spawns one model's worker as a child process (same binary with `--worker`
//! flag), and kills or restarts it on request.

use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use log::{info, warn};

/// How to start a worker: program plus arguments.
#[derive(Debug, Clone)]
pub struct WorkerCommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Manages one worker child process.
#[derive(Debug)]
pub struct ProcessManager {
    model: String,
    child: Mutex<Option<Child>>,
    command: WorkerCommandLine,
    restart_count: AtomicU32,
}

impl ProcessManager {
    /// Spawn a new worker process.
    pub fn spawn(model: &str, command: WorkerCommandLine) -> std::io::Result<Self> {
        let child = spawn_worker(model, &command)?;

        Ok(Self {
            model: model.to_string(),
            child: Mutex::new(Some(child)),
            command,
            restart_count: AtomicU32::new(0),
        })
    }

    /// Take the child's stdin handle for writing commands.
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|c| c.stdin.take()))
    }

    /// Take the child's stdout handle for reading responses.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().and_then(|c| c.stdout.take()))
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&self) -> bool {
        self.child
            .lock()
            .ok()
            .and_then(|mut guard| guard.as_mut().map(|c| matches!(c.try_wait(), Ok(None))))
            .unwrap_or(false)
    }

    /// Kill the worker process immediately.
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(ref mut child) = *guard {
                if matches!(child.try_wait(), Ok(None)) {
                    info!("[PROCESS_MGR] Killing worker for '{}'", self.model);
                    let _ = child.kill();
                }
                let _ = child.wait(); // Reap
            }
            *guard = None;
        }
    }

    /// Restart the worker process (after kill or crash).
    pub fn restart(&self) -> std::io::Result<()> {
        // Kill existing if still alive
        self.kill();

        let child = spawn_worker(&self.model, &self.command)?;
        if let Ok(mut guard) = self.child.lock() {
            *guard = Some(child);
        }
        let count = self.restart_count.fetch_add(1, Ordering::Relaxed) + 1;

        warn!(
            "[PROCESS_MGR] Worker for '{}' restarted (restart #{count})",
            self.model
        );
        Ok(())
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_worker(model: &str, command: &WorkerCommandLine) -> std::io::Result<Child> {
    info!(
        "[PROCESS_MGR] Spawning worker for '{model}': {} {}",
        command.program.display(),
        command.args.join(" ")
    );

    Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit()) // Worker logs go to parent's stderr
        .spawn()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};

    fn cat() -> WorkerCommandLine {
        WorkerCommandLine {
            program: PathBuf::from("cat"),
            args: Vec::new(),
        }
    }

    #[test]
    fn test_spawned_process_is_connected_by_pipes() {
        let pm = ProcessManager::spawn("Echo", cat()).unwrap();
        let mut stdin = pm.take_stdin().unwrap();
        let stdout = pm.take_stdout().unwrap();
        assert!(pm.take_stdin().is_none(), "pipes can only be taken once");

        writeln!(stdin, "hello").unwrap();
        stdin.flush().unwrap();
        let mut line = String::new();
        BufReader::new(stdout).read_line(&mut line).unwrap();
        assert_eq!(line, "hello\n");
        assert!(pm.is_alive());
    }

    #[test]
    fn test_kill_and_restart() {
        let pm = ProcessManager::spawn("Echo", cat()).unwrap();
        pm.kill();
        assert!(!pm.is_alive());

        pm.restart().unwrap();
        assert!(pm.is_alive());
        assert_eq!(pm.restart_count(), 1);
        assert!(pm.take_stdout().is_some());
    }
}
