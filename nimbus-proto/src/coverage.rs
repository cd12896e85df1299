use std::collections::{
    Bound::{Excluded, Included, Unbounded},
    BTreeMap,
};

/// Set of received chunk indices, optimized for long contiguous runs
///
/// Stored as disjoint half-open ranges `start..end`. A well-behaved peer
/// delivers chunks mostly in order, so the map typically holds one or two
/// entries regardless of image size.
#[derive(Debug, Default, Clone)]
pub(crate) struct ChunkCoverage {
    ranges: BTreeMap<u32, u32>,
    received: u32,
}

impl ChunkCoverage {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, x: u32) -> bool {
        self.pred(x).is_some_and(|(_, end)| end > x)
    }

    /// Record chunk `x` as received; returns false for a duplicate
    pub fn insert(&mut self, x: u32) -> bool {
        if let Some((start, end)) = self.pred(x) {
            if end > x {
                return false;
            }
            if end == x {
                // Extend the predecessor, coalescing with the successor
                self.ranges.remove(&start);
                let mut new_end = x + 1;
                if let Some((next_start, next_end)) = self.succ(x) {
                    if next_start == new_end {
                        self.ranges.remove(&next_start);
                        new_end = next_end;
                    }
                }
                self.ranges.insert(start, new_end);
                self.received += 1;
                return true;
            }
        }
        let mut new_end = x + 1;
        if let Some((next_start, next_end)) = self.succ(x) {
            if next_start == new_end {
                self.ranges.remove(&next_start);
                new_end = next_end;
            }
        }
        self.ranges.insert(x, new_end);
        self.received += 1;
        true
    }

    /// Number of distinct chunks received
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Whether every index in `[0, chunk_count)` has been received
    pub fn is_complete(&self, chunk_count: u32) -> bool {
        self.received == chunk_count
    }

    /// Sorted indices in `[0, chunk_count)` not yet received, capped at `cap`
    pub fn missing(&self, chunk_count: u32, cap: usize) -> Vec<u32> {
        let mut out = Vec::new();
        let mut next = 0;
        for (&start, &end) in &self.ranges {
            for x in next..start.min(chunk_count) {
                if out.len() == cap {
                    return out;
                }
                out.push(x);
            }
            next = end;
        }
        for x in next..chunk_count {
            if out.len() == cap {
                break;
            }
            out.push(x);
        }
        out
    }

    fn pred(&self, x: u32) -> Option<(u32, u32)> {
        self.ranges
            .range((Included(0), Included(x)))
            .next_back()
            .map(|(&start, &end)| (start, end))
    }

    fn succ(&self, x: u32) -> Option<(u32, u32)> {
        self.ranges
            .range((Excluded(x), Unbounded))
            .next()
            .map(|(&start, &end)| (start, end))
    }

    #[cfg(test)]
    fn runs(&self) -> impl Iterator<Item = (&u32, &u32)> {
        self.ranges.iter()
    }
}
