// Blip records: wire decoding, legacy position normalization, and structural identity.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::marker_table::SlotIndex;

/// Errors raised while turning a raw wire record into a [`BlipRecord`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("blip record has no category")]
    MissingCategory,
    #[error("blip record of category {0} has neither `pos` nor a complete x/y/z triple")]
    MissingPosition(CategoryKey),
}

/// Category key of a blip (the sprite id on the wire). Numbers and strings are
/// both accepted and compared by their string form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CategoryKey(String);

impl CategoryKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CategoryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CategoryKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for CategoryKey {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for CategoryKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawKey {
            Int(i64),
            Text(String),
        }

        Ok(match RawKey::deserialize(deserializer)? {
            RawKey::Int(n) => Self(n.to_string()),
            RawKey::Text(s) => Self(s),
        })
    }
}

/// A coordinate that may arrive as a JSON number or a numeric string.
fn coord<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }

    match NumOrStr::deserialize(deserializer)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn opt_coord<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    coord(deserializer).map(Some)
}

/// Game-world position triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(deserialize_with = "coord")]
    pub x: f64,
    #[serde(deserialize_with = "coord")]
    pub y: f64,
    #[serde(deserialize_with = "coord")]
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "X {{{:.2}}} Y {{{:.2}}} Z {{{:.2}}}", self.x, self.y, self.z)
    }
}

/// Blip exactly as it appears on the wire, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBlip {
    #[serde(rename = "type", default)]
    category: Option<CategoryKey>,
    #[serde(default)]
    pos: Option<Position>,
    #[serde(default, deserialize_with = "opt_coord")]
    x: Option<f64>,
    #[serde(default, deserialize_with = "opt_coord")]
    y: Option<f64>,
    #[serde(default, deserialize_with = "opt_coord")]
    z: Option<f64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    new_pos: Option<Position>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl RawBlip {
    /// Normalize into a [`BlipRecord`]. `bucket` supplies the category for
    /// snapshots grouped by category; an explicit `type` field wins.
    ///
    /// Legacy records carry flat `x`/`y`/`z` fields instead of `pos`; those are
    /// folded into the position triple and dropped.
    pub fn into_record(self, bucket: Option<&CategoryKey>) -> Result<BlipRecord, RecordError> {
        let category = self
            .category
            .or_else(|| bucket.cloned())
            .ok_or(RecordError::MissingCategory)?;

        let pos = match (self.pos, self.x, self.y, self.z) {
            (Some(pos), ..) => pos,
            (None, Some(x), Some(y), Some(z)) => Position::new(x, y, z),
            _ => return Err(RecordError::MissingPosition(category)),
        };

        Ok(BlipRecord {
            category,
            pos,
            name: self.name,
            description: self.description,
            new_pos: self.new_pos,
            extra: self.extra,
        })
    }
}

/// A normalized incoming blip, as delivered by a snapshot or a feed event.
#[derive(Debug, Clone, PartialEq)]
pub struct BlipRecord {
    pub category: CategoryKey,
    pub pos: Position,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Relocation target carried by update events. Consumed, never stored.
    pub new_pos: Option<Position>,
    pub extra: Map<String, Value>,
}

impl BlipRecord {
    pub fn new(category: impl Into<CategoryKey>, pos: Position) -> Self {
        Self {
            category: category.into(),
            pos,
            name: None,
            description: None,
            new_pos: None,
            extra: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_new_pos(mut self, pos: Position) -> Self {
        self.new_pos = Some(pos);
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> BlipKey {
        BlipKey {
            category: self.category.clone(),
            pos: self.pos,
        }
    }

    /// Whether the record stands for a player and should go to the cluster layer.
    pub fn is_player(&self) -> bool {
        self.extra
            .get("isPlayer")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

impl From<String> for CategoryKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Structural identity of a blip. There is no server-issued key, so two
/// records are the same entity when category and position are equal.
#[derive(Debug, Clone, PartialEq)]
pub struct BlipKey {
    pub category: CategoryKey,
    pub pos: Position,
}

impl BlipKey {
    pub fn matches(&self, blip: &Blip) -> bool {
        self.category == blip.category && self.pos == blip.pos
    }
}

/// A stored blip owned by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Blip {
    #[serde(rename = "type")]
    pub category: CategoryKey,
    pub pos: Position,
    pub name: String,
    pub description: String,
    pub extra: Map<String, Value>,
    /// Index of the marker slot, i.e. the id returned by `MarkerTable::create` minus one.
    #[serde(skip)]
    pub marker_slot: SlotIndex,
}

impl Blip {
    pub fn key(&self) -> BlipKey {
        BlipKey {
            category: self.category.clone(),
            pos: self.pos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> RawBlip {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_numeric_and_string_categories_compare_equal() {
        let a: CategoryKey = serde_json::from_str("2").unwrap();
        let b: CategoryKey = serde_json::from_str("\"2\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "2");
    }

    #[test]
    fn test_legacy_flat_position_is_folded_into_pos() {
        let record = raw(r#"{"type": 1, "x": 1.5, "y": "2", "z": -3, "name": "Shop"}"#)
            .into_record(None)
            .unwrap();
        assert_eq!(record.pos, Position::new(1.5, 2.0, -3.0));
        assert!(!record.extra.contains_key("x"));
        assert_eq!(record.name.as_deref(), Some("Shop"));
    }

    #[test]
    fn test_pos_wins_over_flat_fields() {
        let record = raw(r#"{"type": 1, "pos": {"x": 0, "y": 0, "z": 0}, "x": 9, "y": 9, "z": 9}"#)
            .into_record(None)
            .unwrap();
        assert_eq!(record.pos, Position::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn test_incomplete_position_is_rejected() {
        let err = raw(r#"{"type": 4, "x": 1, "y": 2}"#).into_record(None).unwrap_err();
        assert_eq!(err, RecordError::MissingPosition(CategoryKey::from("4")));
    }

    #[test]
    fn test_bucket_supplies_missing_category() {
        let bucket = CategoryKey::from("7");
        let record = raw(r#"{"pos": {"x": 1, "y": 2, "z": 3}}"#)
            .into_record(Some(&bucket))
            .unwrap();
        assert_eq!(record.category, bucket);

        let err = raw(r#"{"pos": {"x": 1, "y": 2, "z": 3}}"#)
            .into_record(None)
            .unwrap_err();
        assert_eq!(err, RecordError::MissingCategory);
    }

    #[test]
    fn test_extra_attributes_and_player_flag() {
        let record = raw(
            r#"{"type": 1, "pos": {"x": 0, "y": 0, "z": 0}, "isPlayer": true, "owner": "bob",
                "new_pos": {"x": 1, "y": 1, "z": 1}}"#,
        )
        .into_record(None)
        .unwrap();
        assert!(record.is_player());
        assert_eq!(record.extra.get("owner"), Some(&Value::from("bob")));
        assert_eq!(record.new_pos, Some(Position::new(1.0, 1.0, 1.0)));
        assert!(!record.extra.contains_key("new_pos"));
    }

    #[test]
    fn test_position_display() {
        assert_eq!(
            Position::new(1.0, -2.5, 3.333).to_string(),
            "X {1.00} Y {-2.50} Z {3.33}"
        );
    }
}
