//! Mission bookkeeping: control-frame tags and the send/receive pools.
//!
//! The extension tag of every pipe frame is itself a small JSON document keyed
//! by `type`. One framing covers control and data at the cost of a few bytes
//! per frame; anything whose tag does not parse as one of these documents is
//! treated as a raw frame and surfaced out-of-band.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::Frame;

/// Extension-tag document for pipe frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum FrameTag {
    /// Mission announcement; meta is an [`Announce`] document.
    Mission,
    /// One data chunk for the named mission; meta is the chunk bytes.
    Data {
        /// Mission extension id the chunk belongs to.
        extension: String,
    },
    /// Cancellation notice; meta is a [`MissionRef`] document.
    CancelMission,
    /// Reassembly-complete notice (informational); meta is a [`MissionRef`].
    MissionComplete,
}

impl FrameTag {
    /// Serialize the tag into the frame extension string.
    pub(crate) fn to_extension(&self) -> String {
        serde_json::to_string(self).expect("frame tag serialization cannot fail")
    }

    /// Parse a frame extension; `None` for raw (non-pipe) frames.
    pub(crate) fn parse(extension: &str) -> Option<Self> {
        serde_json::from_str(extension).ok()
    }
}

/// Meta document of a mission announcement frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Announce {
    /// Mission extension id, unique per connection per direction.
    pub extension: String,
    /// Total byte count of the mission payload.
    pub length: u64,
    /// Caller-provided headers (route, message_id, application keys).
    pub info: Value,
}

/// Meta document of cancel / complete control frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MissionRef {
    /// Mission extension id.
    pub extension: String,
}

/// An outgoing mission: announced, with its remaining chunks queued.
#[derive(Debug)]
pub(crate) struct OutgoingMission {
    pub id: String,
    pub chunks: VecDeque<Vec<u8>>,
}

/// A control frame queued ahead of data chunks.
///
/// `mission` ties announce frames to their mission so cancellation can pull an
/// announcement that has not hit the wire yet.
#[derive(Debug)]
pub(crate) struct ControlItem {
    pub mission: Option<String>,
    pub frame: Frame,
}

/// Send-side pool: control frames drain before data, data round-robins.
#[derive(Debug, Default)]
pub(crate) struct SendPool {
    pub control: VecDeque<ControlItem>,
    pub active: VecDeque<OutgoingMission>,
}

impl SendPool {
    /// Remove every trace of a mission. Returns `(was_known, announce_unsent)`.
    pub(crate) fn remove_mission(&mut self, id: &str) -> (bool, bool) {
        let mut known = false;
        let before = self.control.len();
        self.control.retain(|c| c.mission.as_deref() != Some(id));
        let announce_unsent = self.control.len() != before;
        if let Some(pos) = self.active.iter().position(|m| m.id == id) {
            self.active.remove(pos);
            known = true;
        }
        (known || announce_unsent, announce_unsent)
    }
}

/// An incoming mission accumulating toward its announced length.
#[derive(Debug)]
pub(crate) struct IncomingMission {
    pub length: u64,
    pub info: Value,
    pub buf: Vec<u8>,
}

/// Split a payload into at-most-`chunk`-sized pieces.
pub(crate) fn split_chunks(data: Vec<u8>, chunk: usize) -> VecDeque<Vec<u8>> {
    let chunk = chunk.max(1);
    if data.len() <= chunk {
        let mut out = VecDeque::with_capacity(1);
        if !data.is_empty() {
            out.push_back(data);
        }
        return out;
    }
    let mut out = VecDeque::with_capacity(data.len().div_ceil(chunk));
    let mut rest = data.as_slice();
    while !rest.is_empty() {
        let take = rest.len().min(chunk);
        out.push_back(rest[..take].to_vec());
        rest = &rest[take..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tags_round_trip_as_json_documents() {
        assert_eq!(FrameTag::Mission.to_extension(), r#"{"type":"mission"}"#);
        let data = FrameTag::Data { extension: "abc123".into() };
        assert_eq!(data.to_extension(), r#"{"type":"data","extension":"abc123"}"#);
        assert_eq!(FrameTag::parse(&data.to_extension()), Some(data));
        assert_eq!(
            FrameTag::parse(r#"{"type":"cancel_mission"}"#),
            Some(FrameTag::CancelMission)
        );
        assert_eq!(
            FrameTag::parse(r#"{"type":"mission_complete"}"#),
            Some(FrameTag::MissionComplete)
        );
    }

    #[test]
    fn non_tag_extensions_are_raw() {
        assert_eq!(FrameTag::parse("report.txt"), None);
        assert_eq!(FrameTag::parse(r#"{"type":"unknown"}"#), None);
        assert_eq!(FrameTag::parse(""), None);
    }

    #[test]
    fn announce_carries_caller_info() {
        let announce = Announce {
            extension: "qqqqqq".into(),
            length: 42,
            info: json!({"route": "sink", "message_id": "m1"}),
        };
        let bytes = serde_json::to_vec(&announce).unwrap();
        let back: Announce = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.extension, "qqqqqq");
        assert_eq!(back.length, 42);
        assert_eq!(back.info["route"], "sink");
    }

    #[test]
    fn split_chunks_covers_edges() {
        assert_eq!(split_chunks(vec![], 4).len(), 0);
        assert_eq!(split_chunks(vec![1, 2, 3], 4).len(), 1);
        assert_eq!(split_chunks(vec![1, 2, 3, 4], 4).len(), 1);
        assert_eq!(split_chunks(vec![1, 2, 3, 4, 5], 4).len(), 2);
        let chunks = split_chunks((0..10).collect(), 3);
        assert_eq!(chunks.len(), 4);
        let total: Vec<u8> = chunks.into_iter().flatten().collect();
        assert_eq!(total, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn split_chunks_chunk_of_one() {
        let chunks = split_chunks(vec![9; 5], 1);
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn remove_mission_pulls_unsent_announce() {
        let mut pool = SendPool::default();
        pool.control.push_back(ControlItem {
            mission: Some("aaa".into()),
            frame: Frame::new("x", vec![]),
        });
        pool.active.push_back(OutgoingMission {
            id: "aaa".into(),
            chunks: VecDeque::from([vec![1u8]]),
        });
        let (known, unsent) = pool.remove_mission("aaa");
        assert!(known);
        assert!(unsent);
        assert!(pool.control.is_empty());
        assert!(pool.active.is_empty());
    }

    #[test]
    fn remove_mission_unknown() {
        let mut pool = SendPool::default();
        let (known, unsent) = pool.remove_mission("zzz");
        assert!(!known);
        assert!(!unsent);
    }
}
