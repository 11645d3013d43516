use std::{
    collections::VecDeque,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    task::JoinSet,
};

const DRAIN_LIMIT: Duration = Duration::from_secs(5);

/// Bounded, shareable buffer of output lines from the tools a deployment
/// runs. Older lines are dropped once `limit` is reached.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    lines: Arc<Mutex<VecDeque<String>>>,
    limit: usize,
}

impl CapturedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(limit.min(256)))),
            limit: limit.max(1),
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.limit {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    /// The last `n` lines joined by newlines.
    pub fn tail(&self, n: usize) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect::<Vec<_>>().join("\n")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("Failed waiting for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} did not finish within {limit:?}")]
    TimedOut { program: String, limit: Duration },
}

/// Runs `command` to completion, streaming stdout and stderr line by line
/// into `output`. The child is killed if it outlives `limit`.
pub async fn run_captured(
    mut command: Command,
    limit: Duration,
    output: &CapturedOutput,
) -> Result<ExitStatus, RunError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| RunError::Spawn {
        program: program.clone(),
        source,
    })?;

    let mut readers = JoinSet::new();
    if let Some(stdout) = child.stdout.take() {
        readers.spawn(forward_lines(stdout, output.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.spawn(forward_lines(stderr, output.clone()));
    }

    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => {
            // Drain whatever is still buffered in the pipes. A grandchild
            // holding the pipe open must not keep us here.
            let drained = tokio::time::timeout(DRAIN_LIMIT, async {
                while readers.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                readers.abort_all();
            }
            Ok(status)
        }
        Ok(Err(source)) => {
            readers.abort_all();
            Err(RunError::Wait { program, source })
        }
        Err(_) => {
            log::warn!("{program} exceeded {limit:?}, killing it");
            if let Err(e) = child.kill().await {
                log::warn!("Failed to kill {program}: {e}");
            }
            readers.abort_all();
            Err(RunError::TimedOut { program, limit })
        }
    }
}

/// Copies `reader` into `output` until EOF. Bytes that are not UTF-8 are
/// replaced, never treated as the end of the stream: closing the pipe early
/// would kill the child with SIGPIPE.
async fn forward_lines<R>(reader: R, output: CapturedOutput)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                log::debug!("{line}");
                output.push(line);
            }
            Err(e) => {
                log::debug!("Stopped reading child output: {e}");
                break;
            }
        }
    }
}
