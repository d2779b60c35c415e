use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigratorError {
    #[error("unknown double write pattern: {0}")]
    UnknownPattern(String),
    #[error("unsupported in double write mode: {0}")]
    Unsupported(String),
    #[error("configuration error: {0}")]
    Config(String),
}

/// A record type whose table is being migrated between two stores.
pub trait Entity {
    /// Stable primary key shared by both stores.
    fn id(&self) -> i64;

    /// Semantic equality, usually every column that is not generated by the store.
    fn compare_to(&self, other: &Self) -> bool;
}

/// One of the two stores taking part in a migration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Src,
    Dst,
}

impl Side {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Src => "src",
            Self::Dst => "dst",
        }
    }

    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Src => Self::Dst,
            Self::Dst => Self::Src,
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Migration phase. Decides which store receives writes and which one answers reads.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    #[default]
    SrcOnly,
    SrcFirst,
    DstFirst,
    DstOnly,
}

impl Pattern {
    pub const ALL: [Self; 4] = [Self::SrcOnly, Self::SrcFirst, Self::DstFirst, Self::DstOnly];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SrcOnly => "src_only",
            Self::SrcFirst => "src_first",
            Self::DstFirst => "dst_first",
            Self::DstOnly => "dst_only",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "src_only" => Some(Self::SrcOnly),
            "src_first" => Some(Self::SrcFirst),
            "dst_first" => Some(Self::DstFirst),
            "dst_only" => Some(Self::DstOnly),
            _ => None,
        }
    }

    /// The store whose result is authoritative for the caller.
    #[must_use]
    pub fn primary(self) -> Side {
        match self {
            Self::SrcOnly | Self::SrcFirst => Side::Src,
            Self::DstFirst | Self::DstOnly => Side::Dst,
        }
    }

    /// The store that receives best-effort copies of writes, if any.
    #[must_use]
    pub fn secondary(self) -> Option<Side> {
        match self {
            Self::SrcFirst => Some(Side::Dst),
            Self::DstFirst => Some(Side::Src),
            Self::SrcOnly | Self::DstOnly => None,
        }
    }

    /// Which store a validation run started under this pattern treats as the base.
    #[must_use]
    pub fn direction(self) -> Direction {
        match self.primary() {
            Side::Src => Direction::Src,
            Side::Dst => Direction::Dst,
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::SrcOnly => 0,
            Self::SrcFirst => 1,
            Self::DstFirst => 2,
            Self::DstOnly => 3,
        }
    }

    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::SrcOnly),
            1 => Some(Self::SrcFirst),
            2 => Some(Self::DstFirst),
            3 => Some(Self::DstOnly),
            _ => None,
        }
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pattern {
    type Err = MigratorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| MigratorError::UnknownPattern(value.to_string()))
    }
}

/// The store an inconsistency is judged against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// The source table is authoritative.
    Src,
    /// The destination table is authoritative.
    Dst,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Src => "SRC",
            Self::Dst => "DST",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SRC" => Some(Self::Src),
            "DST" => Some(Self::Dst),
            _ => None,
        }
    }

    #[must_use]
    pub fn base(self) -> Side {
        match self {
            Self::Src => Side::Src,
            Self::Dst => Side::Dst,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyType {
    /// Present in the base, absent or different in the target.
    TargetMissing,
    /// Present in the target, absent in the base.
    BaseMissing,
    /// Present in both with different content.
    Neq,
}

impl InconsistencyType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TargetMissing => "target_missing",
            Self::BaseMissing => "base_missing",
            Self::Neq => "neq",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "target_missing" => Some(Self::TargetMissing),
            "base_missing" => Some(Self::BaseMissing),
            "neq" => Some(Self::Neq),
            _ => None,
        }
    }
}

impl Display for InconsistencyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification that one row differs between the base and the target.
///
/// Only the ID and the intent are trusted; fixers re-read the base for content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct InconsistentEvent {
    pub id: i64,
    pub direction: Direction,
    #[serde(rename = "type")]
    pub kind: InconsistencyType,
}

impl InconsistentEvent {
    #[must_use]
    pub fn new(id: i64, direction: Direction, kind: InconsistencyType) -> Self {
        Self { id, direction, kind }
    }
}

/// Items of `base` that have no counterpart in `other` according to `eq`.
///
/// Order of `base` is preserved.
pub fn difference_by<'a, T, F>(base: &'a [T], other: &[T], eq: F) -> Vec<&'a T>
where
    F: Fn(&T, &T) -> bool,
{
    base.iter().filter(|item| !other.iter().any(|candidate| eq(*item, candidate))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: i64,
        name: String,
    }

    impl Entity for Row {
        fn id(&self) -> i64 {
            self.id
        }

        fn compare_to(&self, other: &Self) -> bool {
            self == other
        }
    }

    fn row(id: i64, name: &str) -> Row {
        Row { id, name: name.to_string() }
    }

    #[test]
    fn unknown_pattern_is_a_configuration_error() {
        let err = "src_later".parse::<Pattern>();
        assert_eq!(err, Err(MigratorError::UnknownPattern("src_later".to_string())));
    }

    #[test]
    fn every_pattern_has_exactly_one_primary() {
        for pattern in Pattern::ALL {
            assert_eq!(Pattern::parse(pattern.as_str()), Some(pattern));
            assert_eq!(Pattern::from_u8(pattern.as_u8()), Some(pattern));
            if let Some(secondary) = pattern.secondary() {
                assert_eq!(secondary, pattern.primary().other());
            }
        }
        assert_eq!(Pattern::from_u8(9), None);
    }

    #[test]
    fn validation_direction_follows_the_authoritative_store() {
        assert_eq!(Pattern::SrcOnly.direction(), Direction::Src);
        assert_eq!(Pattern::SrcFirst.direction(), Direction::Src);
        assert_eq!(Pattern::DstFirst.direction(), Direction::Dst);
        assert_eq!(Pattern::DstOnly.direction(), Direction::Dst);
        assert_eq!(Direction::Dst.base(), Side::Dst);
    }

    #[test]
    fn inconsistent_event_wire_shape() -> Result<(), serde_json::Error> {
        let event = InconsistentEvent::new(42, Direction::Src, InconsistencyType::TargetMissing);
        let json = serde_json::to_value(event)?;
        assert_eq!(
            json,
            serde_json::json!({"id": 42, "direction": "SRC", "type": "target_missing"})
        );

        let decoded: InconsistentEvent =
            serde_json::from_str(r#"{"id":7,"direction":"DST","type":"base_missing"}"#)?;
        assert_eq!(decoded.kind, InconsistencyType::BaseMissing);
        assert_eq!(decoded.direction, Direction::Dst);
        Ok(())
    }

    #[test]
    fn difference_by_compare_to_reports_missing_and_changed_rows() {
        let base = vec![row(1, "A"), row(2, "B"), row(4, "D")];
        let target = vec![row(1, "A"), row(4, "stale")];

        let diff = difference_by(&base, &target, Entity::compare_to);
        let ids: Vec<i64> = diff.iter().map(|item| item.id()).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn difference_by_id_ignores_content() {
        let target = vec![row(1, "x"), row(3, "C")];
        let base = vec![row(1, "A")];

        let diff = difference_by(&target, &base, |lhs, rhs| lhs.id() == rhs.id());
        assert_eq!(diff, vec![&row(3, "C")]);
    }

    proptest! {
        #[test]
        fn difference_never_returns_rows_matched_in_other(
            base_ids in proptest::collection::vec(0_i64..50, 0..40),
            other_ids in proptest::collection::vec(0_i64..50, 0..40),
        ) {
            let base: Vec<Row> = base_ids.iter().map(|id| row(*id, "v")).collect();
            let other: Vec<Row> = other_ids.iter().map(|id| row(*id, "v")).collect();

            let diff = difference_by(&base, &other, Entity::compare_to);

            for item in &diff {
                prop_assert!(!other_ids.contains(&item.id));
            }
            let expected = base_ids.iter().filter(|id| !other_ids.contains(id)).count();
            prop_assert_eq!(diff.len(), expected);
        }
    }
}
