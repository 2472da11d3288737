//! Range analyser: reconstructs the authoritative history of a shard-range
//! set in the presence of concurrent, timestamped edits.
//!
//! Ranges are linked into a DAG keyed on matching bounds (a range whose lower
//! equals another's upper is its successor). Nodes live in a flat arena and
//! refer to each other by integer id. A depth-first walk from each root
//! enumerates candidate paths carrying the running max timestamp; ties between
//! paths sharing a max timestamp are broken by comparing the timestamps of the
//! ranges they do not share.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::errors::AnalyserError;
use crate::types::shard_range::ShardRange;
use crate::types::timestamp::Timestamp;

/// One reconstructed path through the namespace.
#[derive(Debug, Clone)]
pub struct AnalysedPath {
    /// Chain of non-overlapping ranges, sorted by bounds.
    pub path: Vec<ShardRange>,
    /// Input ranges that are not part of this path.
    pub leftovers: Vec<ShardRange>,
    /// True iff the path runs from -inf to +inf.
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathId {
    Complete(usize),
    Incomplete(usize),
}

/// A DAG node: one range plus the shared successor slot it feeds into.
struct Link {
    range: usize,
    children: Option<usize>,
}

/// Analyses a set of shard ranges into candidate paths, newest first.
#[derive(Default)]
pub struct RangeAnalyser {
    ranges: Vec<ShardRange>,
    links: Vec<Link>,
    /// Successor lists, shared between links with the same upper bound.
    /// Slot 0 holds the roots anchored at -inf.
    slots: Vec<Vec<usize>>,
    /// Links whose lower bound matches no other range's upper.
    gap_roots: Vec<usize>,
    complete: Vec<Vec<usize>>,
    incomplete: Vec<Vec<usize>>,
    newest: BTreeMap<Timestamp, Vec<PathId>>,
}

impl RangeAnalyser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enumerate `(path, leftovers, complete)` triples, newest path first.
    pub fn analyse(&mut self, ranges: &[ShardRange]) -> Result<Vec<AnalysedPath>, AnalyserError> {
        *self = Self::default();
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        for range in ranges {
            if !range.upper.is_empty() && range.lower >= range.upper {
                return Err(AnalyserError::MalformedBounds {
                    name: range.name(),
                    lower: range.lower.clone(),
                    upper: range.upper.clone(),
                });
            }
        }
        self.ranges = ranges.to_vec();
        self.ranges.sort_by(|a, b| a.cmp_bounds(b));
        self.build();
        self.scan()?;
        Ok(self.pick())
    }

    fn build(&mut self) {
        self.slots.push(Vec::new());
        let mut slot_for_bound: FxHashMap<String, usize> = FxHashMap::default();
        slot_for_bound.insert(String::new(), 0);

        for range_idx in 0..self.ranges.len() {
            let link_id = self.links.len();
            self.links.push(Link { range: range_idx, children: None });

            let lower = self.ranges[range_idx].lower.clone();
            match slot_for_bound.get(&lower) {
                Some(&slot) => self.slots[slot].push(link_id),
                None => self.gap_roots.push(link_id),
            }

            let upper = self.ranges[range_idx].upper.clone();
            if !upper.is_empty() {
                let slot = *slot_for_bound.entry(upper).or_insert_with(|| {
                    self.slots.push(Vec::new());
                    self.slots.len() - 1
                });
                self.links[link_id].children = Some(slot);
            }
        }
    }

    fn scan(&mut self) -> Result<(), AnalyserError> {
        for root in self.slots[0].clone() {
            let ts = self.ranges[self.links[root].range].timestamp;
            let (newest, complete, result) = self.walk(root, ts, Vec::new());
            self.post_result(newest, complete, result);
        }
        // A path rooted in a gap can never be complete even if it reaches +inf.
        for root in self.gap_roots.clone() {
            let ts = self.ranges[self.links[root].range].timestamp;
            let (newest, _, result) = self.walk(root, ts, Vec::new());
            self.post_result(newest, false, result);
        }
        self.break_ties()
    }

    fn walk(
        &mut self,
        link_id: usize,
        ts: Timestamp,
        mut result: Vec<usize>,
    ) -> (Timestamp, bool, Vec<usize>) {
        let range_idx = self.links[link_id].range;
        let newest = ts.max(self.ranges[range_idx].timestamp);
        result.push(range_idx);

        let children: Vec<usize> = match self.links[link_id].children {
            Some(slot) => self.slots[slot].clone(),
            None => Vec::new(),
        };
        if children.is_empty() {
            let complete = self.ranges[range_idx].upper.is_empty();
            return (newest, complete, result);
        }
        // Recurse into non-primary branches, recording their paths; the
        // primary branch continues the current path.
        for &child in &children[1..] {
            let fork = result.clone();
            let (forked_newest, complete, forked) = self.walk(child, newest, fork);
            self.post_result(forked_newest, complete, forked);
        }
        self.walk(children[0], newest, result)
    }

    fn post_result(&mut self, newest: Timestamp, complete: bool, result: Vec<usize>) {
        let id = if complete {
            self.complete.push(result);
            PathId::Complete(self.complete.len() - 1)
        } else {
            // An incomplete path starting after -inf may be the tail of
            // another incomplete path; splice onto the best candidate.
            let first = result[0];
            let mut best: Option<usize> = None;
            for (i, path) in self.incomplete.iter().enumerate() {
                let last = *path.last().unwrap_or(&first);
                if self.ranges[last].upper.is_empty() {
                    continue;
                }
                if self.ranges[last].cmp_bounds(&self.ranges[first]) != Ordering::Less {
                    continue;
                }
                best = match best {
                    None => Some(i),
                    Some(b) => {
                        let best_last = *self.incomplete[b].last().unwrap_or(&first);
                        if self.ranges[best_last].cmp_bounds(&self.ranges[last]) == Ordering::Less {
                            Some(i)
                        } else {
                            Some(b)
                        }
                    }
                };
            }
            match best {
                Some(i) => {
                    self.incomplete[i].extend(result);
                    let id = PathId::Incomplete(i);
                    // The spliced path already has a newest entry; move it
                    // only if this segment makes the path newer.
                    let current = self
                        .newest
                        .iter()
                        .find(|(_, ids)| ids.contains(&id))
                        .map(|(ts, _)| *ts);
                    if let Some(old) = current {
                        if old.max(newest) == old {
                            return;
                        }
                        let ids = self.newest.get_mut(&old).unwrap_or_else(|| unreachable!());
                        if ids.len() > 1 {
                            ids.retain(|x| *x != id);
                        } else {
                            self.newest.remove(&old);
                        }
                    }
                    id
                }
                None => {
                    self.incomplete.push(result);
                    PathId::Incomplete(self.incomplete.len() - 1)
                }
            }
        };
        self.newest.entry(newest).or_default().push(id);
    }

    fn path_of(&self, id: PathId) -> &[usize] {
        match id {
            PathId::Complete(i) => &self.complete[i],
            PathId::Incomplete(i) => &self.incomplete[i],
        }
    }

    /// Paths tied on max timestamp are ordered by the timestamps of the
    /// ranges each does not share with the others; losers get the stored key
    /// bumped by offset so the order is total and deterministic.
    fn break_ties(&mut self) -> Result<(), AnalyserError> {
        let tied: Vec<(Timestamp, Vec<PathId>)> = self
            .newest
            .iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(ts, ids)| (*ts, ids.clone()))
            .collect();

        for (ts, ids) in tied {
            let mut keyed: Vec<(PathId, String)> = Vec::with_capacity(ids.len());
            for &id in &ids {
                let path = self.path_of(id);
                let mut diff_maxes: Vec<Timestamp> = Vec::new();
                for &other in &ids {
                    if other == id {
                        continue;
                    }
                    let other_members: FxHashSet<usize> =
                        self.path_of(other).iter().copied().collect();
                    let diff_max = path
                        .iter()
                        .filter(|r| !other_members.contains(r))
                        .map(|&r| self.ranges[r].timestamp)
                        .max()
                        .ok_or(AnalyserError::IndistinctPaths { timestamp: ts })?;
                    diff_maxes.push(diff_max);
                }
                diff_maxes.sort_unstable_by(|a, b| b.cmp(a));
                let key: String = diff_maxes.iter().map(|t| t.internal()).collect();
                keyed.push((id, key));
            }
            keyed.sort_by(|a, b| a.1.cmp(&b.1));
            self.newest.remove(&ts);
            let mut bumped = ts;
            for (id, _) in keyed {
                bumped = bumped.with_offset(bumped.offset() + 1);
                self.newest.insert(bumped, vec![id]);
            }
        }
        Ok(())
    }

    fn pick(&self) -> Vec<AnalysedPath> {
        let mut out = Vec::new();
        for ids in self.newest.values().rev() {
            let id = ids[0];
            let members: FxHashSet<usize> = self.path_of(id).iter().copied().collect();
            let mut path: Vec<ShardRange> =
                members.iter().map(|&i| self.ranges[i].clone()).collect();
            path.sort_by(|a, b| a.cmp_bounds(b));
            let mut leftovers: Vec<ShardRange> = (0..self.ranges.len())
                .filter(|i| !members.contains(i))
                .map(|i| self.ranges[i].clone())
                .collect();
            leftovers.sort_by(|a, b| a.cmp_bounds(b));
            leftovers.dedup();
            out.push(AnalysedPath {
                path,
                leftovers,
                complete: matches!(id, PathId::Complete(_)),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::shard_range::ShardState;

    fn sr(lower: &str, upper: &str, ts: i64) -> ShardRange {
        let mut range = ShardRange::new(
            "a",
            format!("c-{lower}-{upper}-{ts}"),
            Timestamp::from_usecs(ts),
            lower,
            upper,
        );
        range.state = ShardState::Active;
        range
    }

    #[test]
    fn empty_input_yields_no_paths() {
        assert!(RangeAnalyser::new().analyse(&[]).unwrap().is_empty());
    }

    #[test]
    fn single_tile_is_one_complete_path() {
        let ranges = vec![sr("", "m", 1), sr("m", "t", 1), sr("t", "", 1)];
        let paths = RangeAnalyser::new().analyse(&ranges).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].complete);
        assert_eq!(paths[0].path.len(), 3);
        assert!(paths[0].leftovers.is_empty());
    }

    #[test]
    fn newer_pair_wins_over_older_pair() {
        let ranges = vec![sr("", "m", 1), sr("m", "", 1), sr("", "p", 2), sr("p", "", 2)];
        let paths = RangeAnalyser::new().analyse(&ranges).unwrap();
        assert_eq!(paths.len(), 2);

        let primary = &paths[0];
        assert!(primary.complete);
        assert_eq!(
            primary.path.iter().map(|r| r.upper.as_str()).collect::<Vec<_>>(),
            vec!["p", ""]
        );
        assert_eq!(primary.leftovers.len(), 2);

        let secondary = &paths[1];
        assert!(secondary.complete);
        assert_eq!(
            secondary.path.iter().map(|r| r.upper.as_str()).collect::<Vec<_>>(),
            vec!["m", ""]
        );
    }

    #[test]
    fn gap_rooted_path_is_never_complete() {
        let ranges = vec![sr("x", "", 5)];
        let paths = RangeAnalyser::new().analyse(&ranges).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(!paths[0].complete);
    }

    #[test]
    fn incomplete_head_and_tail_are_stitched() {
        // Head covers -inf..m; tail covers t..+inf; the gap (m, t) keeps the
        // stitched path incomplete.
        let ranges = vec![sr("", "m", 3), sr("t", "", 4)];
        let paths = RangeAnalyser::new().analyse(&ranges).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(!paths[0].complete);
        assert_eq!(paths[0].path.len(), 2);
    }

    #[test]
    fn fork_produces_alternate_path() {
        // Two candidate successors of ("", "m"): one older, one newer.
        let ranges = vec![sr("", "m", 1), sr("m", "", 1), sr("m", "z", 9), sr("z", "", 9)];
        let paths = RangeAnalyser::new().analyse(&ranges).unwrap();
        assert_eq!(paths[0].path.len(), 3);
        assert_eq!(
            paths[0].path.iter().map(|r| r.upper.as_str()).collect::<Vec<_>>(),
            vec!["m", "z", ""]
        );
        assert!(paths[0].complete);
    }

    #[test]
    fn tied_paths_get_deterministic_offsets() {
        // Both paths end in a ts=5 range; the set difference decides.
        let ranges = vec![
            sr("", "m", 2),
            sr("", "m", 4),
            sr("m", "", 5),
        ];
        let paths = RangeAnalyser::new().analyse(&ranges).unwrap();
        assert_eq!(paths.len(), 2);
        // The path carrying the ts=4 head wins the tie.
        assert_eq!(paths[0].path[0].timestamp, Timestamp::from_usecs(4));
        assert_eq!(paths[1].path[0].timestamp, Timestamp::from_usecs(2));
    }

    #[test]
    fn malformed_bounds_are_rejected() {
        let mut bad = sr("x", "", 1);
        bad.upper = "a".to_string();
        let err = RangeAnalyser::new().analyse(&[bad]).unwrap_err();
        assert!(matches!(err, AnalyserError::MalformedBounds { .. }));
    }

    #[test]
    fn duplicate_whole_namespace_ranges_order_deterministically() {
        let ranges = vec![sr("", "", 7), sr("", "", 7)];
        let paths = RangeAnalyser::new().analyse(&ranges).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.complete));
        assert_eq!(paths[0].path.len(), 1);
    }
}
