//! Per-session output reader.
//!
//! Demultiplexes the attached stdio stream into lines, batches them for the
//! event publisher, and turns an unexpected end of stream into a `crashed`
//! transition.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use hostmgr_session::SessionStatus;
use tokio::{
    io::AsyncRead,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    events::{EventPublisher, LogLine, LogSource},
    frames::{FrameReader, LineAssembler, StreamKind},
    registry::{ReaderHandle, SessionEntry},
    runtime::ContainerRuntime,
};

const EXIT_PROBE_ATTEMPTS: usize = 5;
/// Consecutive stream failures tolerated while the container keeps running.
const MAX_REATTACH: usize = 1;
const EXIT_PROBE_DELAY: Duration = Duration::from_millis(200);
/// Exit code recorded when the runtime cannot tell us the real one.
pub const UNKNOWN_EXIT_CODE: i64 = -1;

#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    pub batch_lines: usize,
    pub flush_interval: Duration,
}

enum StreamEnd {
    Cancelled,
    Eof,
    Failed(std::io::Error),
}

struct Batcher {
    entry: Arc<SessionEntry>,
    events: EventPublisher,
    batch: Vec<LogLine>,
    limit: usize,
    stdout: LineAssembler,
    stderr: LineAssembler,
    scratch: Vec<String>,
}

impl Batcher {
    fn push(&mut self, stream: StreamKind, payload: &[u8]) {
        let asm = match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        asm.push(payload, &mut self.scratch);
        self.take_scratch(stream.into());
    }

    fn take_scratch(&mut self, source: LogSource) {
        for line in self.scratch.drain(..) {
            self.batch.push(LogLine::now(source, line));
            if self.batch.len() >= self.limit {
                let lines = std::mem::take(&mut self.batch);
                self.events.logs(self.entry.id, lines);
            }
        }
    }

    fn flush(&mut self) {
        if !self.batch.is_empty() {
            let lines = std::mem::take(&mut self.batch);
            self.events.logs(self.entry.id, lines);
        }
    }

    fn finish(&mut self) {
        self.stdout.finish(&mut self.scratch);
        self.take_scratch(LogSource::Stdout);
        self.stderr.finish(&mut self.scratch);
        self.take_scratch(LogSource::Stderr);
        self.flush();
    }
}

/// Spawn the reader. The caller must have moved the session to `running`
/// first so an immediate EOF is classified as a crash.
pub fn spawn(
    entry: Arc<SessionEntry>,
    output: Box<dyn AsyncRead + Send + Unpin>,
    runtime: Arc<dyn ContainerRuntime>,
    events: EventPublisher,
    settings: ReaderSettings,
) -> ReaderHandle {
    let cancel = CancellationToken::new();
    let span = tracing::info_span!(
        "output_reader",
        session_id = %entry.id,
        slot_id = %entry.slot_id,
        container = %entry.container_name
    );
    let task = tokio::spawn(
        run(entry, output, runtime, events, settings, cancel.clone()).instrument(span),
    );
    ReaderHandle { cancel, task }
}

async fn run(
    entry: Arc<SessionEntry>,
    output: Box<dyn AsyncRead + Send + Unpin>,
    runtime: Arc<dyn ContainerRuntime>,
    events: EventPublisher,
    settings: ReaderSettings,
    cancel: CancellationToken,
) {
    let mut reader = FrameReader::new(output);
    let mut batcher = Batcher {
        entry: entry.clone(),
        events: events.clone(),
        batch: Vec::new(),
        limit: settings.batch_lines.max(1),
        stdout: LineAssembler::default(),
        stderr: LineAssembler::default(),
        scratch: Vec::new(),
    };

    let mut tick = interval(settings.flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await;

    let mut failures = 0;
    let end = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            frame = reader.next_frame() => frame,
            _ = tick.tick() => {
                batcher.flush();
                continue;
            }
        };
        match next {
            Ok(Some(frame)) => {
                failures = 0;
                batcher.push(frame.stream, &frame.payload);
            }
            Ok(None) => break StreamEnd::Eof,
            Err(e) if failures < MAX_REATTACH => {
                failures += 1;
                match reattach(&entry, runtime.as_ref(), &cancel).await {
                    Some(output) => {
                        tracing::warn!(error = %e, "output stream failed, re-attached");
                        reader = FrameReader::new(output);
                    }
                    None if cancel.is_cancelled() => break StreamEnd::Cancelled,
                    None => break StreamEnd::Failed(e),
                }
            }
            Err(e) => break StreamEnd::Failed(e),
        }
    };
    batcher.finish();

    match end {
        StreamEnd::Cancelled => {
            tracing::debug!("output reader cancelled");
        }
        StreamEnd::Eof => {
            tracing::debug!("output stream closed");
            on_stream_end(&entry, runtime.as_ref(), &events).await;
        }
        StreamEnd::Failed(e) => {
            if entry.status() == SessionStatus::Running
                && still_running(runtime.as_ref(), &entry.container_name).await
            {
                // A broken attach says nothing about the game process.
                tracing::error!(error = %e, "output stream lost while the container is running");
                events.agent_line(entry.id, "console output lost; the server is still running");
                return;
            }
            tracing::warn!(error = %e, "output stream failed");
            on_stream_end(&entry, runtime.as_ref(), &events).await;
        }
    }
}

async fn still_running(runtime: &dyn ContainerRuntime, container: &str) -> bool {
    matches!(runtime.inspect_container(container).await, Ok(info) if info.running)
}

/// Attach again to a container whose stream broke. Stdin is replaced too,
/// since it rides the same connection.
async fn reattach(
    entry: &SessionEntry,
    runtime: &dyn ContainerRuntime,
    cancel: &CancellationToken,
) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
    if entry.status() != SessionStatus::Running
        || !still_running(runtime, &entry.container_name).await
    {
        return None;
    }
    let attachment = match runtime.attach(&entry.container_name).await {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(error = %e, "re-attach failed");
            return None;
        }
    };
    if cancel.is_cancelled() {
        return None;
    }
    entry.set_stdin(attachment.input).await;
    Some(attachment.output)
}

/// The stream can close a moment before the runtime reports the container
/// as exited, so poll briefly for the final state.
async fn final_exit_code(runtime: &dyn ContainerRuntime, container: &str) -> Option<i64> {
    for attempt in 0..EXIT_PROBE_ATTEMPTS {
        match runtime.inspect_container(container).await {
            Ok(info) if !info.running => return info.exit_code,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(container, error = %e, "inspect after stream end failed");
                return None;
            }
        }
        if attempt + 1 < EXIT_PROBE_ATTEMPTS {
            tokio::time::sleep(EXIT_PROBE_DELAY).await;
        }
    }
    None
}

async fn on_stream_end(entry: &SessionEntry, runtime: &dyn ContainerRuntime, events: &EventPublisher) {
    if entry.status() != SessionStatus::Running {
        // Stop/Kill in progress: the stream end is expected.
        return;
    }

    let exit_code = final_exit_code(runtime, &entry.container_name)
        .await
        .unwrap_or(UNKNOWN_EXIT_CODE);

    let crashed = entry.update(|st| {
        if st.status != SessionStatus::Running {
            return false;
        }
        st.status = SessionStatus::Crashed;
        st.exit_code = Some(exit_code);
        st.stopped_at = Some(Utc::now());
        true
    });
    if !crashed {
        return;
    }

    tracing::warn!(exit_code, "game process exited unexpectedly");
    events.agent_line(entry.id, format!("process exited unexpectedly (exit code {exit_code})"));
    events.status(
        entry.id,
        entry.slot_id,
        SessionStatus::Crashed,
        Some(exit_code),
        Some("container exited".to_string()),
    );
}
