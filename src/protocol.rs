// Decoding of live-feed frames and bulk snapshots into normalized records.

use serde_json::Value;
use thiserror::Error;

use crate::overlay::blip::{BlipRecord, CategoryKey, RawBlip, RecordError};
use crate::overlay::players::PlayerData;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no `type` field")]
    MissingKind,
    #[error("message `{0}` has no payload")]
    MissingPayload(String),
    #[error("invalid blip: {0}")]
    Record(#[from] RecordError),
    #[error("snapshot must be an object of categories or an array of blips")]
    SnapshotShape,
}

/// One incremental change pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    AddBlip(BlipRecord),
    UpdateBlip(BlipRecord),
    RemoveBlip(BlipRecord),
    PlayerData(Vec<PlayerData>),
    PlayerLeft(String),
}

impl FeedEvent {
    /// Label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::AddBlip(_) => "addBlip",
            FeedEvent::UpdateBlip(_) => "updateBlip",
            FeedEvent::RemoveBlip(_) => "removeBlip",
            FeedEvent::PlayerData(_) => "playerData",
            FeedEvent::PlayerLeft(_) => "playerLeft",
        }
    }
}

/// Decode a feed text frame `{"type": ..., "payload": ...}`.
/// Unknown message kinds yield `Ok(None)`.
pub fn decode_feed_message(text: &str) -> Result<Option<FeedEvent>, ProtocolError> {
    let mut message: Value = serde_json::from_str(text)?;
    let kind = message
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingKind)?
        .to_string();
    let payload = message
        .get_mut("payload")
        .map(Value::take)
        .ok_or_else(|| ProtocolError::MissingPayload(kind.clone()))?;

    let blip = |payload: Value| -> Result<BlipRecord, ProtocolError> {
        let raw: RawBlip = serde_json::from_value(payload)?;
        Ok(raw.into_record(None)?)
    };

    let event = match kind.as_str() {
        "addBlip" => FeedEvent::AddBlip(blip(payload)?),
        "updateBlip" => FeedEvent::UpdateBlip(blip(payload)?),
        "removeBlip" => FeedEvent::RemoveBlip(blip(payload)?),
        "playerData" => FeedEvent::PlayerData(serde_json::from_value(payload)?),
        "playerLeft" => FeedEvent::PlayerLeft(serde_json::from_value(payload)?),
        other => {
            tracing::debug!(kind = other, "ignoring unknown feed message");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

/// A decoded bulk snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub records: Vec<BlipRecord>,
    /// Records dropped because they could not be normalized.
    pub skipped: usize,
}

/// Decode a snapshot body, either grouped by category (`{"1": [...], ...}`) or a flat
/// array of blips carrying their own `type`. Invalid records are skipped, not fatal.
pub fn decode_snapshot(body: &str) -> Result<Snapshot, ProtocolError> {
    let root: Value = serde_json::from_str(body)?;
    let mut snapshot = Snapshot::default();

    let mut push = |raw: Value, bucket: Option<&CategoryKey>| {
        let record = serde_json::from_value::<RawBlip>(raw)
            .map_err(ProtocolError::from)
            .and_then(|raw| raw.into_record(bucket).map_err(ProtocolError::from));
        match record {
            Ok(record) => snapshot.records.push(record),
            Err(e) => {
                tracing::warn!("Skipping snapshot blip: {e}");
                snapshot.skipped += 1;
            }
        }
    };

    match root {
        Value::Object(groups) => {
            for (category, blips) in groups {
                let bucket = CategoryKey::new(category);
                let Value::Array(blips) = blips else {
                    return Err(ProtocolError::SnapshotShape);
                };
                for raw in blips {
                    push(raw, Some(&bucket));
                }
            }
        }
        Value::Array(blips) => {
            for raw in blips {
                push(raw, None);
            }
        }
        _ => return Err(ProtocolError::SnapshotShape),
    }

    Ok(snapshot)
}
