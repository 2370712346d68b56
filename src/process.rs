use std::io::ErrorKind;
use std::io::Read;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::trace;
use log::warn;

use crate::ToolError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured output of a successful tool invocation.
pub(crate) struct ToolOutput {
    pub stdout: String,
}

/// Run `command` to completion, killing it after `timeout`.
///
/// Standard input is closed, standard output and error are captured.
/// Non-zero exit status is an error. Standard error of a successful run is only logged.
pub(crate) fn run(mut command: Command, timeout: Duration) -> Result<ToolOutput, ToolError> {
    let program = PathBuf::from(command.get_program());
    trace!("Running {:?}", command);
    let mut child = match command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(ToolError::NotFound(program)),
        Err(e) => return Err(ToolError::Io(program, e)),
    };
    let stdout = child.stdout.take().map(read_in_background);
    let stderr = child.stderr.take().map(read_in_background);
    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => return Err(ToolError::Io(program, e)),
        }
        let now = Instant::now();
        if now >= deadline {
            warn!("Killing {:?}: no response after {:?}", program, timeout);
            // The child might have exited in the meantime.
            let _ = child.kill();
            let _ = child.wait();
            return Err(ToolError::Timeout(program, timeout));
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    };
    let stdout = join_output(stdout);
    let stderr = join_output(stderr);
    if !status.success() {
        return Err(ToolError::Failed {
            program,
            status,
            stderr: stderr.trim().to_string(),
        });
    }
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        debug!("{:?}: {}", program, stderr);
    }
    Ok(ToolOutput { stdout })
}

fn read_in_background<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn join_output(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    let bytes = handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}
