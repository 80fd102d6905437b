//! TW-010: Local process execution with line capture and cancellation.

use super::{CancelToken, CommandSpec, ExecError, ExecOutput};
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Read `stream` line by line, echoing to stdout/stderr when asked.
fn capture<R: Read + Send + 'static>(
    stream: R,
    echo: bool,
    to_stderr: bool,
) -> thread::JoinHandle<Vec<String>> {
    thread::spawn(move || {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            let line = String::from_utf8_lossy(&buf).into_owned();
            if echo {
                if to_stderr {
                    eprintln!("{}", line);
                } else {
                    println!("{}", line);
                }
            }
            lines.push(line);
        }
        lines
    })
}

fn joined(handle: Option<thread::JoinHandle<Vec<String>>>) -> String {
    let lines = handle.and_then(|h| h.join().ok()).unwrap_or_default();
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

/// Run a command to completion. Polls `cancel` and kills the child once set.
pub fn exec_command(spec: &CommandSpec, cancel: &CancelToken) -> Result<ExecOutput, ExecError> {
    let program = spec.program.display().to_string();
    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled { program });
    }
    tracing::debug!(cwd = %spec.cwd.display(), "exec: {}", spec.display());

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

    let out = child.stdout.take().map(|s| capture(s, spec.echo, false));
    let err = child.stderr.take().map(|s| capture(s, spec.echo, true));

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExecError::Io { program, source });
            }
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            // Grandchildren may still hold the pipes; detach the readers.
            drop((out, err));
            return Err(ExecError::Cancelled { program });
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: joined(out),
        stderr: joined(err),
    })
}
