//! Shard ranges and the namespace algebra over them.
//!
//! A shard range names the child container owning a slice of the root's
//! namespace. Bounds are lower-exclusive / upper-inclusive; the empty string
//! means unbounded on that side. All comparisons are lexicographic on UTF-8
//! bytes.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::timestamp::Timestamp;

/// Lifecycle state of a shard range.
///
/// Ranges advance `Found -> Created -> (Cleaved | Active)`; a live range may
/// enter `Sharding` (it grew too big), `Shrinking` (donor) or `Expanding`
/// (acceptor), and ends at `Sharded` once its contents have been cleaved away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    Found,
    Created,
    Cleaved,
    Active,
    Sharding,
    Shrinking,
    Expanding,
    Sharded,
}

impl ShardState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::Created => "created",
            Self::Cleaved => "cleaved",
            Self::Active => "active",
            Self::Sharding => "sharding",
            Self::Shrinking => "shrinking",
            Self::Expanding => "expanding",
            Self::Sharded => "sharded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "found" => Some(Self::Found),
            "created" => Some(Self::Created),
            "cleaved" => Some(Self::Cleaved),
            "active" => Some(Self::Active),
            "sharding" => Some(Self::Sharding),
            "shrinking" => Some(Self::Shrinking),
            "expanding" => Some(Self::Expanding),
            "sharded" => Some(Self::Sharded),
            _ => None,
        }
    }
}

/// A namespace record: the child container owning `(lower, upper]` of some
/// root container, with its stats and conflict-resolution timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardRange {
    pub account: String,
    pub container: String,
    pub lower: String,
    pub upper: String,
    pub timestamp: Timestamp,
    pub state: ShardState,
    pub state_timestamp: Timestamp,
    pub meta_timestamp: Timestamp,
    pub object_count: u64,
    pub bytes_used: u64,
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<Timestamp>,
}

/// Compare two upper bounds where the empty string is +infinity.
pub fn cmp_upper(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

impl ShardRange {
    /// A new range in `Found` state with zeroed stats.
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        timestamp: Timestamp,
        lower: impl Into<String>,
        upper: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            lower: lower.into(),
            upper: upper.into(),
            timestamp,
            state: ShardState::Found,
            state_timestamp: timestamp,
            meta_timestamp: timestamp,
            object_count: 0,
            bytes_used: 0,
            deleted: false,
            epoch: None,
        }
    }

    /// `account/container`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.account, self.container)
    }

    /// Deterministic child-container naming: repeated discovery of the same
    /// split yields the same name.
    pub fn make_path(
        shards_account: &str,
        root_container: &str,
        parent_container: &str,
        timestamp: Timestamp,
        index: usize,
    ) -> (String, String) {
        let container = format!(
            "{}-{}-{}-{}",
            root_container,
            parent_container,
            timestamp.internal(),
            index
        );
        (shards_account.to_string(), container)
    }

    /// Exclusive end marker for object listings over this range.
    pub fn end_marker(&self) -> String {
        if self.upper.is_empty() {
            String::new()
        } else {
            format!("{}\u{0}", self.upper)
        }
    }

    /// True iff the namespaces intersect.
    pub fn overlaps(&self, other: &Self) -> bool {
        let max_lower = self.lower.as_str().max(other.lower.as_str());
        let min_upper = match cmp_upper(&self.upper, &other.upper) {
            Ordering::Greater => other.upper.as_str(),
            _ => self.upper.as_str(),
        };
        min_upper.is_empty() || max_lower < min_upper
    }

    /// True iff `other`'s namespace lies entirely within this one.
    pub fn includes(&self, other: &Self) -> bool {
        self.lower <= other.lower && cmp_upper(&other.upper, &self.upper) != Ordering::Greater
    }

    /// True iff an object with this name belongs in the range.
    pub fn includes_name(&self, name: &str) -> bool {
        (self.lower.is_empty() || name > self.lower.as_str())
            && (self.upper.is_empty() || name <= self.upper.as_str())
    }

    /// Total order on `(lower, upper)` with unbounded upper sorting last;
    /// ties broken by timestamp then name so sorts are deterministic.
    pub fn cmp_bounds(&self, other: &Self) -> Ordering {
        self.lower
            .cmp(&other.lower)
            .then_with(|| cmp_upper(&self.upper, &other.upper))
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.account.cmp(&other.account))
            .then_with(|| self.container.cmp(&other.container))
    }

    /// Move to `state` at `state_timestamp`; returns false for a no-op.
    pub fn update_state_at(&mut self, state: ShardState, state_timestamp: Timestamp) -> bool {
        if state == self.state {
            return false;
        }
        self.state = state;
        self.state_timestamp = state_timestamp;
        true
    }

    /// Move to `state` now; returns false for a no-op.
    pub fn update_state(&mut self, state: ShardState) -> bool {
        self.update_state_at(state, Timestamp::now())
    }

    /// Replace the stats, stamping `meta_timestamp`.
    pub fn update_meta_at(&mut self, object_count: u64, bytes_used: u64, meta_timestamp: Timestamp) {
        self.object_count = object_count;
        self.bytes_used = bytes_used;
        self.meta_timestamp = meta_timestamp;
    }

    /// Replace the stats now.
    pub fn update_meta(&mut self, object_count: u64, bytes_used: u64) {
        self.update_meta_at(object_count, bytes_used, Timestamp::now());
    }
}

/// Groups of mutually overlapping ranges, each group sorted by bounds.
/// Disjoint inputs produce no groups.
pub fn find_overlapping_ranges(ranges: &[ShardRange]) -> Vec<Vec<ShardRange>> {
    let mut result: Vec<Vec<ShardRange>> = Vec::new();
    for range in ranges {
        let mut group: Vec<ShardRange> = ranges
            .iter()
            .filter(|other| *other != range && other.overlaps(range))
            .cloned()
            .collect();
        if group.is_empty() {
            continue;
        }
        group.push(range.clone());
        group.sort_by(|a, b| a.cmp_bounds(b));
        if !result.contains(&group) {
            result.push(group);
        }
    }
    result
}

/// The gaps in a range set: `(upper, lower)` pairs where some range's upper
/// bound has no successor range starting there. A complete tile of the
/// namespace yields no pairs.
pub fn check_complete_ranges(ranges: &[ShardRange]) -> Vec<(String, String)> {
    use std::collections::BTreeSet;

    let lowers: BTreeSet<&str> = ranges.iter().map(|r| r.lower.as_str()).collect();
    let uppers: BTreeSet<&str> = ranges.iter().map(|r| r.upper.as_str()).collect();
    let dangling_uppers = uppers.difference(&lowers);
    let dangling_lowers = lowers.difference(&uppers);
    dangling_uppers
        .zip(dangling_lowers)
        .map(|(u, l)| (u.to_string(), l.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sr(lower: &str, upper: &str) -> ShardRange {
        ShardRange::new("a", format!("c-{lower}-{upper}"), Timestamp::from_usecs(1), lower, upper)
    }

    #[test]
    fn overlaps_is_symmetric() {
        let a = sr("", "m");
        let b = sr("h", "t");
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let a = sr("", "m");
        let b = sr("m", "");
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn unbounded_ranges_overlap_everything() {
        let whole = sr("", "");
        for other in [sr("", "m"), sr("m", "t"), sr("t", "")] {
            assert!(whole.overlaps(&other));
            assert!(other.overlaps(&whole));
        }
    }

    #[test]
    fn includes_is_reflexive_and_antisymmetric() {
        let outer = sr("b", "y");
        let inner = sr("c", "m");
        assert!(outer.includes(&outer));
        assert!(outer.includes(&inner));
        assert!(!inner.includes(&outer));

        let same = sr("b", "y");
        assert!(outer.includes(&same) && same.includes(&outer));
        assert_eq!(outer.lower, same.lower);
        assert_eq!(outer.upper, same.upper);
    }

    #[test]
    fn unbounded_bounds_compare_correctly() {
        let all = sr("", "");
        assert!(all.includes(&sr("", "m")));
        assert!(all.includes(&sr("m", "")));
        assert!(all.includes_name("\u{0}"));
        assert!(all.includes_name("\u{10ffff}"));
        assert_eq!(cmp_upper("", "zzz"), Ordering::Greater);
        assert_eq!(cmp_upper("zzz", ""), Ordering::Less);
    }

    #[test]
    fn unicode_names_assign_to_the_correct_side() {
        let low = sr("", "caf\u{e9}");
        let high = sr("caf\u{e9}", "");
        // U+00E9 is two UTF-8 bytes; "cafe" sorts below "café", "caff" above.
        assert!(low.includes_name("cafe"));
        assert!(low.includes_name("caf\u{e9}"));
        assert!(high.includes_name("caff"));
        assert!(!high.includes_name("caf\u{e9}"));
    }

    #[test]
    fn state_update_is_a_noop_for_same_state() {
        let mut range = sr("", "m");
        let before = range.state_timestamp;
        assert!(!range.update_state_at(ShardState::Found, Timestamp::from_usecs(99)));
        assert_eq!(range.state_timestamp, before);
        assert!(range.update_state_at(ShardState::Created, Timestamp::from_usecs(99)));
        assert_eq!(range.state_timestamp, Timestamp::from_usecs(99));
    }

    #[test]
    fn complete_tile_has_no_gaps() {
        let ranges = [sr("", "m"), sr("m", "t"), sr("t", "")];
        assert!(check_complete_ranges(&ranges).is_empty());
    }

    #[test]
    fn missing_middle_range_is_reported_as_gap() {
        let ranges = [sr("", "m"), sr("t", "")];
        let gaps = check_complete_ranges(&ranges);
        assert_eq!(gaps, vec![("m".to_string(), "t".to_string())]);
    }

    #[test]
    fn overlapping_groups_are_found_and_deduped() {
        let ranges = [sr("", "m"), sr("h", "t"), sr("t", "")];
        let groups = find_overlapping_ranges(&ranges);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
        assert!(find_overlapping_ranges(&[sr("", "m"), sr("m", "")]).is_empty());
    }

    #[test]
    fn wire_record_round_trips() {
        let mut range = sr("", "m");
        range.object_count = 42;
        range.bytes_used = 4096;
        range.epoch = Some(Timestamp::from_usecs(7));
        let json = serde_json::to_string(&range).unwrap();
        let back: ShardRange = serde_json::from_str(&json).unwrap();
        assert_eq!(range, back);
    }

    #[test]
    fn state_serialises_as_lowercase_string() {
        let json = serde_json::to_string(&ShardState::Cleaved).unwrap();
        assert_eq!(json, "\"cleaved\"");
    }
}
