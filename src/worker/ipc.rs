//! Framed parent↔child transport for worker processes.
//!
//! The child writes length-delimited frames on stdout: first a JSON
//! header, then (on success) one frame of raw image bytes. Length
//! prefixing keeps the byte buffer identical end to end; nothing ever
//! re-encodes it. Logging in the child goes to stderr so stdout stays a
//! clean channel.

use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};

use crate::config::ImageType;
use crate::history::Trigger;
use crate::naming::ConfigId;
use crate::pipeline::{PipelineRunner, RunOptions};

/// Upper bound on a single frame; far above any plausible raster.
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Build the codec used on both ends.
#[must_use]
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// First frame of every child response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHeader {
    /// Whether the run succeeded; a bytes frame follows iff true.
    pub ok: bool,
    /// MIME type of the bytes frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Output codec of the bytes frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<ImageType>,
    /// CRC32 of the bytes frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32: Option<String>,
    /// End-to-end run time in milliseconds.
    pub duration_ms: u64,
    /// Number of events rendered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_count: Option<usize>,
    /// Machine-readable failure kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Human-readable failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Child-process entry: run the pipeline once and stream the result.
///
/// The child always caches on success, so the parent's cache (the same
/// directory) holds the artifact by the time the frames arrive. The
/// child's cache must run with [`crate::cache::HistoryMode::Awaited`]:
/// the ledger entry has to be on disk before this function returns,
/// because the process exits right after.
///
/// # Errors
///
/// Returns an error only when the frames themselves cannot be written;
/// pipeline failures are reported in-band via the header.
pub async fn run_child(
    runner: &dyn PipelineRunner,
    id: &ConfigId,
    trigger: Trigger,
) -> anyhow::Result<()> {
    let result = runner
        .run(
            id,
            RunOptions {
                trigger,
                save_cache: true,
            },
        )
        .await;

    let mut frames = FramedWrite::new(tokio::io::stdout(), codec());
    match result {
        Ok(output) => {
            let header = WorkerHeader {
                ok: true,
                content_type: Some(output.content_type),
                image_type: Some(output.image_type),
                crc32: Some(output.crc32),
                duration_ms: output.duration_ms,
                event_count: Some(output.event_count),
                error_kind: None,
                error: None,
            };
            frames.send(Bytes::from(serde_json::to_vec(&header)?)).await?;
            frames.send(Bytes::from(output.bytes)).await?;
        }
        Err(e) => {
            tracing::error!(id = %id, error = %e, "Worker pipeline run failed");
            let header = WorkerHeader {
                ok: false,
                content_type: None,
                image_type: None,
                crc32: None,
                duration_ms: 0,
                event_count: None,
                error_kind: Some(e.kind().to_owned()),
                error: Some(e.to_string()),
            };
            frames.send(Bytes::from(serde_json::to_vec(&header)?)).await?;
        }
    }
    frames.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = WorkerHeader {
            ok: true,
            content_type: Some("image/png".to_owned()),
            image_type: Some(ImageType::Png),
            crc32: Some("cbf43926".to_owned()),
            duration_ms: 42,
            event_count: Some(7),
            error_kind: None,
            error: None,
        };
        let json = serde_json::to_vec(&header).unwrap();
        let parsed: WorkerHeader = serde_json::from_slice(&json).unwrap();
        assert!(parsed.ok);
        assert_eq!(parsed.crc32.as_deref(), Some("cbf43926"));
        assert_eq!(parsed.event_count, Some(7));
    }

    #[test]
    fn error_header_omits_success_fields() {
        let header = WorkerHeader {
            ok: false,
            content_type: None,
            image_type: None,
            crc32: None,
            duration_ms: 10,
            event_count: None,
            error_kind: Some("FetchFailed".to_owned()),
            error: Some("upstream returned status 502".to_owned()),
        };
        let json = serde_json::to_value(&header).unwrap();
        assert!(json.get("contentType").is_none());
        assert_eq!(json["errorKind"], "FetchFailed");
    }
}
