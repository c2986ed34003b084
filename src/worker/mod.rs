//! Isolated worker processes for CPU-heavy generation.
//!
//! Scheduled (and boot/config-change) runs never render on the serving
//! path: each submission spawns a fresh child process of this same
//! program, which runs the pipeline, commits the cache, and streams the
//! framed result back. No process is reused, so renderer state cannot
//! accumulate across runs.
//!
//! Submissions are single-flight per config: a second `submit` for an id
//! with a run already in flight coalesces onto the same future and both
//! callers see the identical outcome.

pub mod ipc;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tokio_util::codec::FramedRead;

use crate::config::ImageType;
use crate::history::Trigger;
use crate::naming::ConfigId;

use ipc::WorkerHeader;

/// A worker failure, cheap to clone across coalesced callers.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct WorkerError {
    /// Machine-readable kind (mirrors the pipeline error kinds, plus
    /// `WorkerCrashed`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl WorkerError {
    fn crashed(id: &ConfigId, exit_code: Option<i32>, message: impl Into<String>) -> Self {
        let message = message.into();
        let exit = exit_code.map_or_else(|| "signal".to_owned(), |c| c.to_string());
        Self {
            kind: "WorkerCrashed".to_owned(),
            message: format!("worker for {id} (exit {exit}): {message}"),
        }
    }
}

/// A successful worker run. Bytes are shared across coalesced callers.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    /// Encoded image bytes, exactly as the child produced them.
    pub bytes: Arc<Vec<u8>>,
    /// MIME type of the bytes.
    pub content_type: String,
    /// Output codec.
    pub image_type: ImageType,
    /// CRC32 of the bytes.
    pub crc32: String,
    /// Child-measured run time in milliseconds.
    pub duration_ms: u64,
    /// Number of events rendered.
    pub event_count: usize,
}

/// Capability to run generation out of process; what the scheduler is
/// handed at composition time.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run (or join) the generation for `id`.
    ///
    /// # Errors
    ///
    /// [`WorkerError`] carrying the child's failure kind, or
    /// `WorkerCrashed` when the child died without a result.
    async fn submit(&self, id: &ConfigId, trigger: Trigger) -> Result<WorkerOutcome, WorkerError>;
}

type SharedJob = Shared<BoxFuture<'static, Result<WorkerOutcome, WorkerError>>>;

/// Spawns one child process per submission, single-flight per config.
pub struct WorkerPool {
    program: PathBuf,
    /// Extra environment for spawned children (directories, log level);
    /// children otherwise inherit the parent environment.
    env: Vec<(String, String)>,
    in_flight: Mutex<HashMap<String, (u64, SharedJob)>>,
    next_job: AtomicU64,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("program", &self.program).finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create a pool spawning the current executable.
    ///
    /// # Errors
    ///
    /// Fails when the current executable path cannot be resolved.
    pub fn from_current_exe() -> std::io::Result<Arc<Self>> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Create a pool spawning `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_env(program, Vec::new())
    }

    /// Create a pool spawning `program` with extra child environment.
    #[must_use]
    pub fn with_env(program: impl Into<PathBuf>, env: Vec<(String, String)>) -> Arc<Self> {
        Arc::new(Self {
            program: program.into(),
            env,
            in_flight: Mutex::new(HashMap::new()),
            next_job: AtomicU64::new(0),
        })
    }

    /// Number of runs currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

#[async_trait]
impl JobRunner for WorkerPool {
    async fn submit(&self, id: &ConfigId, trigger: Trigger) -> Result<WorkerOutcome, WorkerError> {
        let key = id.cache_key();

        let (job_id, job) = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some((job_id, job)) = in_flight.get(&key) {
                tracing::debug!(id = %id, "Coalescing onto in-flight worker run");
                (*job_id, job.clone())
            } else {
                let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
                let program = self.program.clone();
                let env = self.env.clone();
                let id = id.clone();
                let job: SharedJob = spawn_child(program, env, id, trigger).boxed().shared();
                in_flight.insert(key.clone(), (job_id, job.clone()));
                (job_id, job)
            }
        };

        let result = job.await;

        // First caller back removes the completed entry; a later job for
        // the same key is left alone.
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if in_flight.get(&key).is_some_and(|(current, _)| *current == job_id) {
            in_flight.remove(&key);
        }
        drop(in_flight);

        result
    }
}

/// Spawn the child, read its frames, and wait for exit.
async fn spawn_child(
    program: PathBuf,
    env: Vec<(String, String)>,
    id: ConfigId,
    trigger: Trigger,
) -> Result<WorkerOutcome, WorkerError> {
    tracing::info!(id = %id, trigger = %trigger, "Spawning worker process");

    let mut command = tokio::process::Command::new(&program);
    command
        .args(["worker", "--id", id.as_str(), "--trigger", trigger.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    for (name, value) in env {
        command.env(name, value);
    }
    let mut child = command
        .spawn()
        .map_err(|e| WorkerError::crashed(&id, None, format!("spawn failed: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| WorkerError::crashed(&id, None, "child stdout missing"))?;
    let mut frames = FramedRead::new(stdout, ipc::codec());

    let header: Option<WorkerHeader> = match frames.next().await {
        Some(Ok(frame)) => serde_json::from_slice(&frame).ok(),
        _ => None,
    };
    let bytes = if header.as_ref().is_some_and(|h| h.ok) {
        match frames.next().await {
            Some(Ok(frame)) => Some(frame.freeze().to_vec()),
            _ => None,
        }
    } else {
        None
    };

    let status = child
        .wait()
        .await
        .map_err(|e| WorkerError::crashed(&id, None, format!("wait failed: {e}")))?;

    let Some(header) = header else {
        return Err(WorkerError::crashed(
            &id,
            status.code(),
            "exited without a result message",
        ));
    };

    if !header.ok {
        return Err(WorkerError {
            kind: header.error_kind.unwrap_or_else(|| "Unknown".to_owned()),
            message: header.error.unwrap_or_else(|| "worker reported failure".to_owned()),
        });
    }

    let Some(bytes) = bytes else {
        return Err(WorkerError::crashed(
            &id,
            status.code(),
            "result header arrived without image bytes",
        ));
    };

    if !status.success() {
        // The frames were complete; a dirty exit afterwards is suspect
        // enough to discard the run.
        return Err(WorkerError::crashed(&id, status.code(), "non-zero exit after result"));
    }

    tracing::info!(
        id = %id,
        crc32 = header.crc32.as_deref().unwrap_or("-"),
        duration_ms = header.duration_ms,
        size = bytes.len(),
        "Worker run complete"
    );

    Ok(WorkerOutcome {
        bytes: Arc::new(bytes),
        content_type: header.content_type.unwrap_or_else(|| "application/octet-stream".to_owned()),
        image_type: header.image_type.unwrap_or_default(),
        crc32: header.crc32.unwrap_or_default(),
        duration_ms: header.duration_ms,
        event_count: header.event_count.unwrap_or(0),
    })
}
