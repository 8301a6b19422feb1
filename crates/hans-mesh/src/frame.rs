//! Wire frames and the newline-delimited JSON codec
//!
//! Every frame is one JSON object on its own line:
//! `{"type": "<kind>", "data": <payload>}`.

use hans_core::{Round, StateSnapshot};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{MeshError, MeshResult};
use crate::message::{Envelope, SessionEvent};
use crate::name::FollowerName;

/// Upper bound for one encoded frame, newline excluded
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Frame {
    /// Follower → leader: first frame on every connection
    Register { name: FollowerName },
    /// Leader → follower: registration accepted
    Registered { relay: bool },
    /// Leader → follower: registration refused; the connection closes
    Rejected { reason: String },
    /// Either direction: user payload
    Message(Envelope),
    /// Leader → follower: session start/stop announcement
    Session { event: SessionEvent },
    /// Relay → leader: the relay's current view of the session
    State { snapshot: StateSnapshot },
    /// Relay → leader: a platform round began
    RoundStarted { round: Round },
    /// Relay → leader: the platform round ended
    RoundEnded,
    /// Leader → follower: you are the relay now
    Promoted,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "register",
            Frame::Registered { .. } => "registered",
            Frame::Rejected { .. } => "rejected",
            Frame::Message(_) => "message",
            Frame::Session { .. } => "session",
            Frame::State { .. } => "state",
            Frame::RoundStarted { .. } => "round_started",
            Frame::RoundEnded => "round_ended",
            Frame::Promoted => "promoted",
        }
    }
}

/// Encode a frame as one line, trailing newline included
pub fn encode(frame: &Frame) -> MeshResult<String> {
    let mut line = serde_json::to_string(frame)?;
    if line.len() > MAX_FRAME_BYTES {
        return Err(MeshError::MessageTooLarge {
            size: line.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    line.push('\n');
    Ok(line)
}

/// Reject a frame that could never be written, before it is queued
pub fn ensure_fits(frame: &Frame) -> MeshResult<()> {
    encode(frame).map(drop)
}

pub fn decode(line: &str) -> MeshResult<Frame> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(MeshError::MessageTooLarge {
            size: line.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    serde_json::from_str(line).map_err(|e| MeshError::DeserializationFailed(e.to_string()))
}

/// Next frame from a line stream; `Ok(None)` on a clean end of stream
///
/// Blank lines are skipped. A malformed line yields an error but leaves the
/// stream usable.
pub async fn read_frame<R>(lines: &mut Lines<R>) -> MeshResult<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match lines.next_line().await? {
            None => return Ok(None),
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => return decode(&line).map(Some),
        }
    }
}

/// Write queued frames until the queue closes or the peer goes away
pub async fn write_frames<W>(mut writer: W, mut queue: mpsc::UnboundedReceiver<Frame>) -> MeshResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = queue.recv().await {
        let line = match encode(&frame) {
            Ok(line) => line,
            Err(err) => {
                warn!(kind = frame.kind(), error = %err, "Dropping unencodable frame");
                continue;
            }
        };
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Recipients;
    use hans_core::{ParticipantId, Position, SnapshotCell};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::BufReader;

    #[test]
    fn test_adjacent_tagging() {
        let frame = Frame::Registered { relay: true };
        let line = encode(&frame).unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value, json!({"type": "registered", "data": {"relay": true}}));

        let unit = encode(&Frame::RoundEnded).unwrap();
        assert_eq!(unit.trim(), r#"{"type":"round_ended"}"#);
    }

    #[test]
    fn test_message_frame_embeds_envelope() {
        let frame = Frame::Message(Envelope::from_leader(Recipients::All, "go"));
        let value: serde_json::Value = serde_json::from_str(encode(&frame).unwrap().trim()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["data"]["recipients"], "all");
        assert_eq!(value["data"]["payload"], "go");
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(matches!(
            decode(r#"{"type":"teleport","data":{}}"#),
            Err(MeshError::DeserializationFailed(_))
        ));
    }

    #[test]
    fn test_oversized_frame_is_refused() {
        let frame = Frame::Message(Envelope::from_leader(
            Recipients::All,
            "x".repeat(MAX_FRAME_BYTES),
        ));
        assert!(matches!(
            encode(&frame),
            Err(MeshError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_frames_cross_a_pipe_in_order() {
        let (client, server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();

        let cell = SnapshotCell::default();
        cell.set_position(ParticipantId(3), Position::new(1.5, -2.0));
        let frames = vec![
            Frame::Register {
                name: FollowerName::parse("f1").unwrap(),
            },
            Frame::RoundStarted {
                round: hans_core::Round::new(4, Duration::from_secs(20)),
            },
            Frame::State {
                snapshot: (*cell.current()).clone(),
            },
            Frame::RoundEnded,
        ];
        for frame in &frames {
            tx.send(frame.clone()).unwrap();
        }
        drop(tx);

        let writer = tokio::spawn(write_frames(client, rx));
        let mut lines = BufReader::new(server).lines();
        let mut received = Vec::new();
        while let Some(frame) = read_frame(&mut lines).await.unwrap() {
            received.push(frame);
        }
        writer.await.unwrap().unwrap();

        assert_eq!(received, frames);
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_poison_stream() {
        let input: &[u8] = b"not json\n\n{\"type\":\"promoted\"}\n";
        let mut lines = BufReader::new(input).lines();
        assert!(read_frame(&mut lines).await.is_err());
        assert_eq!(read_frame(&mut lines).await.unwrap(), Some(Frame::Promoted));
        assert_eq!(read_frame(&mut lines).await.unwrap(), None);
    }
}
