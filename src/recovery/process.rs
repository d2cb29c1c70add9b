use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{RecoveryError, Result};

fn program_name(cmd: &Command) -> String {
    let program = cmd.as_std().get_program();
    Path::new(program)
        .file_name()
        .unwrap_or(program)
        .to_string_lossy()
        .into_owned()
}

fn stderr_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim_end().to_string()
}

/// Run a tool to completion. Stdout passes through to the parent so the
/// tool's own output stays visible; stderr is captured and becomes the error
/// payload verbatim on a non-zero exit. Dropping the returned future kills
/// the child.
pub async fn run_tool(mut cmd: Command) -> Result<()> {
    cmd.stdin(Stdio::null());
    wait_checked(cmd).await
}

/// Same as [`run_tool`] with the child's stdin fed from the given source.
pub async fn run_tool_with_stdin(mut cmd: Command, stdin: Stdio) -> Result<()> {
    cmd.stdin(stdin);
    wait_checked(cmd).await
}

async fn wait_checked(mut cmd: Command) -> Result<()> {
    debug!(command = ?cmd.as_std(), "running external tool");
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    let program = program_name(&cmd);
    let child = cmd.spawn().map_err(|e| RecoveryError::Tool {
        program: program.clone(),
        stderr: format!("failed to start: {e}"),
    })?;
    let output = child.wait_with_output().await.map_err(|e| RecoveryError::Tool {
        program: program.clone(),
        stderr: format!("failed to wait: {e}"),
    })?;
    if !output.status.success() {
        return Err(RecoveryError::Tool {
            program,
            stderr: stderr_text(&output.stderr),
        });
    }
    Ok(())
}

/// Outcome of streaming a tool's stdout.
#[derive(Debug)]
pub struct LineScan<T> {
    /// The visitor's match, if any line produced one before EOF
    pub value: Option<T>,

    /// Captured stderr, for composing not-found errors at the call site
    pub stderr: String,

    /// Whether the tool exited non-zero (or was killed after a match)
    pub tool_failed: bool,
}

/// Stream a tool's stdout through `visit` line by line. The child is killed
/// as soon as the visitor yields a value or fails; a visitor error gets the
/// captured stderr appended when the tool itself also failed.
pub async fn scan_lines<T, F>(mut cmd: Command, mut visit: F) -> Result<LineScan<T>>
where
    F: FnMut(&str) -> Result<Option<T>>,
{
    debug!(command = ?cmd.as_std(), "scanning external tool output");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    let program = program_name(&cmd);
    let mut child = cmd.spawn().map_err(|e| RecoveryError::Tool {
        program: program.clone(),
        stderr: format!("failed to start: {e}"),
    })?;
    let stdout = child.stdout.take().expect("child stdout is piped");
    let mut lines = BufReader::new(stdout).lines();

    let mut value = None;
    let mut visit_err = None;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match visit(&line) {
                Ok(Some(found)) => {
                    value = Some(found);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    visit_err = Some(e);
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                visit_err = Some(RecoveryError::Parse {
                    message: format!("failed to read {program} output: {e}"),
                });
                break;
            }
        }
    }

    drop(lines);
    let _ = child.start_kill();
    let output = child.wait_with_output().await.map_err(|e| RecoveryError::Tool {
        program: program.clone(),
        stderr: format!("failed to wait: {e}"),
    })?;
    let stderr = stderr_text(&output.stderr);
    let tool_failed = !output.status.success();

    if let Some(err) = visit_err {
        if tool_failed && !stderr.is_empty() {
            return Err(match err {
                RecoveryError::Parse { message } => RecoveryError::Parse {
                    message: format!("{message}: {stderr}"),
                },
                other => other,
            });
        }
        return Err(err);
    }
    Ok(LineScan {
        value,
        stderr,
        tool_failed,
    })
}

/// Run `producer | consumer` with the producer's stdout wired straight into
/// the consumer's stdin and both stderr streams captured independently.
///
/// The consumer is waited first so the producer sees EOF or a closed pipe
/// instead of blocking; its stderr is the primary error. A producer failure
/// afterwards merges its stderr into any error already present rather than
/// replacing it.
pub async fn pipe_tools(mut producer: Command, mut consumer: Command) -> Result<()> {
    producer.stdin(Stdio::null());
    producer.stdout(Stdio::piped());
    producer.stderr(Stdio::piped());
    producer.kill_on_drop(true);
    let producer_name = program_name(&producer);
    let mut producer_child = producer.spawn().map_err(|e| RecoveryError::Tool {
        program: producer_name.clone(),
        stderr: format!("failed to start: {e}"),
    })?;
    let stdout = producer_child
        .stdout
        .take()
        .expect("producer stdout is piped");
    let stdout: Stdio = stdout.try_into().map_err(|e| RecoveryError::Tool {
        program: producer_name.clone(),
        stderr: format!("failed to take the stdout pipe: {e}"),
    })?;

    consumer.stdin(stdout);
    consumer.stdout(Stdio::inherit());
    consumer.stderr(Stdio::piped());
    consumer.kill_on_drop(true);
    let consumer_name = program_name(&consumer);
    let consumer_child = match consumer.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = producer_child.start_kill();
            let _ = producer_child.wait().await;
            return Err(RecoveryError::Tool {
                program: consumer_name,
                stderr: format!("failed to start: {e}"),
            });
        }
    };

    let mut pipe_err = match consumer_child.wait_with_output().await {
        Ok(output) if output.status.success() => None,
        Ok(output) => Some(RecoveryError::Tool {
            program: consumer_name,
            stderr: stderr_text(&output.stderr),
        }),
        Err(e) => Some(RecoveryError::Tool {
            program: consumer_name,
            stderr: format!("failed to wait: {e}"),
        }),
    };

    match producer_child.wait_with_output().await {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            let stderr = stderr_text(&output.stderr);
            pipe_err = Some(match pipe_err {
                Some(err) => RecoveryError::Tool {
                    program: producer_name,
                    stderr: format!("{stderr} (after: {err})"),
                },
                None => RecoveryError::Tool {
                    program: producer_name,
                    stderr,
                },
            });
        }
        Err(e) => {
            if pipe_err.is_none() {
                pipe_err = Some(RecoveryError::Tool {
                    program: producer_name,
                    stderr: format!("failed to wait: {e}"),
                });
            }
        }
    }

    match pipe_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_successful_tool_returns_ok() {
        run_tool(sh("exit 0")).await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_tool_reports_stderr_verbatim() {
        let err = run_tool(sh("echo boom >&2; exit 2")).await.unwrap_err();
        match err {
            RecoveryError::Tool { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_scan_stops_at_the_first_match() {
        let cmd = sh("echo 'skip'; echo 'match'; exec sleep 30");
        let scan = tokio::time::timeout(
            Duration::from_secs(5),
            scan_lines(cmd, |line| {
                Ok((line == "match").then(|| line.to_string()))
            }),
        )
        .await
        .expect("scan should not wait for the child to finish")
        .unwrap();
        assert_eq!(scan.value.as_deref(), Some("match"));
    }

    #[tokio::test]
    async fn test_visitor_error_carries_tool_stderr() {
        let cmd = sh("echo 'oops' >&2; echo 'bogus'; exit 3");
        let err = scan_lines::<(), _>(cmd, |_| {
            Err(RecoveryError::Parse {
                message: "bad line".to_string(),
            })
        })
        .await
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bad line"), "{message}");
        assert!(message.contains("oops"), "{message}");
    }

    #[tokio::test]
    async fn test_scan_reports_stderr_at_eof() {
        let scan = scan_lines::<(), _>(sh("echo 'warning' >&2; exit 1"), |_| Ok(None))
            .await
            .unwrap();
        assert!(scan.value.is_none());
        assert!(scan.tool_failed);
        assert_eq!(scan.stderr, "warning");
    }

    #[tokio::test]
    async fn test_pipe_feeds_producer_output_to_consumer() {
        let producer = sh("printf 'one\\ntwo\\n'");
        let consumer = sh("read a; read b; [ \"$b\" = two ]");
        pipe_tools(producer, consumer).await.unwrap();
    }

    #[tokio::test]
    async fn test_consumer_failure_is_the_primary_error() {
        let producer = sh("echo data");
        let consumer = sh("echo consumer-broke >&2; exit 4");
        let err = pipe_tools(producer, consumer).await.unwrap_err();
        assert!(err.to_string().contains("consumer-broke"), "{err}");
    }

    #[tokio::test]
    async fn test_producer_failure_surfaces_when_consumer_succeeds() {
        let producer = sh("echo producer-broke >&2; exit 5");
        let consumer = sh("cat >/dev/null");
        let err = pipe_tools(producer, consumer).await.unwrap_err();
        assert!(err.to_string().contains("producer-broke"), "{err}");
    }
}
