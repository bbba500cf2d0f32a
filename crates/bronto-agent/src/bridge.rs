// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live I/O bridge between attach sessions and callers.
//!
//! Log streaming runs a pump task per stream that reads the combined
//! stdout/stderr of an attach session line by line and forwards each line
//! into a bounded channel. The pump stops when both streams close, when a
//! read fails, when the receiving side goes away, or when its cancellation
//! token fires. On exit it closes the attach session and releases the attach
//! permit it was given.
//!
//! Commands are written as a single newline-terminated line on a dedicated
//! stdin session that is closed right after the write.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::runtime::{AttachSession, BoxedReader};

type LineReader = Lines<BufReader<BoxedReader>>;

/// Ordered sequence of log lines from a running instance.
///
/// Dropping the stream cancels its pump task.
#[derive(Debug)]
pub struct LogStream {
    instance_id: u32,
    lines: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl LogStream {
    /// Instance the lines come from.
    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// Next line, or `None` once the stream has ended.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Stop the pump. Lines already buffered can still be read.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Stream for LogStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.lines.poll_recv(cx)
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start pumping the output of `session` into a [`LogStream`].
///
/// `permit` is held until the pump ends. `cancel` should be a token owned by
/// this stream alone; cancelling it ends the pump.
pub fn spawn_log_pump(
    instance_id: u32,
    mut session: AttachSession,
    permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
    buffer: usize,
) -> LogStream {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let task_cancel = cancel.clone();

    let mut stdout = session
        .take_stdout()
        .map(|reader| BufReader::new(reader).lines());
    let mut stderr = session
        .take_stderr()
        .map(|reader| BufReader::new(reader).lines());

    tokio::spawn(async move {
        debug!(instance_id, container_id = %session.container_id(), "Log pump started");

        while stdout.is_some() || stderr.is_some() {
            let (source, line) = tokio::select! {
                _ = task_cancel.cancelled() => break,
                line = next_line(&mut stdout) => ("stdout", line),
                line = next_line(&mut stderr) => ("stderr", line),
            };

            match line {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    if source == "stdout" {
                        stdout = None;
                    } else {
                        stderr = None;
                    }
                }
                Err(e) => {
                    warn!(instance_id, stream = source, error = %e, "Log stream read failed");
                    break;
                }
            }
        }

        if let Err(e) = session.close().await {
            debug!(instance_id, error = %e, "Closing log session failed");
        }
        drop(permit);
        debug!(instance_id, "Log pump finished");
    });

    LogStream {
        instance_id,
        lines: rx,
        cancel,
    }
}

/// Read the next line of an optional reader; pending forever once closed.
async fn next_line(reader: &mut Option<LineReader>) -> std::io::Result<Option<String>> {
    match reader {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

/// Terminate `text` with exactly one newline.
pub fn normalize_command(text: &str) -> String {
    let trimmed = text.trim_end_matches(['\r', '\n']);
    format!("{}\n", trimmed)
}

/// Write one command line to the session's stdin and close the session.
pub async fn send_line(mut session: AttachSession, text: &str) -> std::io::Result<()> {
    let line = normalize_command(text);

    let written = match session.stdin_mut() {
        Some(stdin) => match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        },
        None => Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "attach session has no stdin",
        )),
    };

    let closed = session.close().await;
    written.and(closed)
}
