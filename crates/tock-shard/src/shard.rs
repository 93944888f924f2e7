use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ShardError;

/// Partition identifier a job is tagged with and a worker listens to.
///
/// Stored as the string `{node_count}-{node_id}`; the struct form is used
/// everywhere except at the storage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Shard {
    pub node_id: u32,
    pub node_count: u32,
}

impl Shard {
    pub fn new(node_id: u32, node_count: u32) -> Self {
        Self {
            node_id,
            node_count,
        }
    }

    /// Serialise to the storage form, e.g. `"3-17"`.
    pub fn format(&self) -> String {
        format!("{}-{}", self.node_count, self.node_id)
    }

    /// Parse the storage form back into a `Shard`.
    pub fn parse(s: &str) -> Result<Self, ShardError> {
        let (count, id) = s
            .split_once('-')
            .ok_or_else(|| ShardError::InvalidTag(s.to_string()))?;
        let node_count = count
            .parse::<u32>()
            .map_err(|_| ShardError::InvalidTag(s.to_string()))?;
        let node_id = id
            .parse::<u32>()
            .map_err(|_| ShardError::InvalidTag(s.to_string()))?;
        Ok(Self {
            node_id,
            node_count,
        })
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

impl FromStr for Shard {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Shard> for String {
    fn from(shard: Shard) -> Self {
        shard.format()
    }
}

impl TryFrom<String> for Shard {
    type Error = ShardError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

/// Which jobs a listener observes: `None` means every job, `Some(shards)`
/// means jobs tagged with at least one of `shards`.
pub type ShardFilter = Option<Vec<Shard>>;

/// True when a job carrying `tags` is visible through `filter`.
pub fn filter_matches(filter: &ShardFilter, tags: &[Shard]) -> bool {
    match filter {
        None => true,
        Some(wanted) => tags.iter().any(|t| wanted.contains(t)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_form_is_count_then_id() {
        assert_eq!(Shard::new(17, 3).format(), "3-17");
        assert_eq!(Shard::parse("11-104").unwrap(), Shard::new(104, 11));
    }

    #[test]
    fn serde_uses_string_form() {
        let json = serde_json::to_string(&vec![Shard::new(4, 2)]).unwrap();
        assert_eq!(json, r#"["2-4"]"#);
        let back: Vec<Shard> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![Shard::new(4, 2)]);
    }

    #[test]
    fn malformed_tags_are_rejected() {
        assert!(Shard::parse("3").is_err());
        assert!(Shard::parse("a-1").is_err());
        assert!(Shard::parse("3-").is_err());
        assert!(serde_json::from_str::<Shard>(r#""x-y""#).is_err());
    }

    #[test]
    fn none_filter_matches_everything() {
        assert!(filter_matches(&None, &[]));
        assert!(filter_matches(&None, &[Shard::new(1, 2)]));
    }

    #[test]
    fn filter_needs_one_common_tag() {
        let filter = Some(vec![Shard::new(0, 2), Shard::new(1, 2)]);
        assert!(filter_matches(&filter, &[Shard::new(5, 3), Shard::new(1, 2)]));
        assert!(!filter_matches(&filter, &[Shard::new(1, 3)]));
        assert!(!filter_matches(&filter, &[]));
    }
}
