use std::cmp::Ordering;

/// A contiguous byte range `[start, start + length)` that holds real (non-default) data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Saturates at `u64::MAX` rather than panicking on a hostile length.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn intersect(&self, start: u64, len: u64) -> Option<Extent> {
        let lo = self.start.max(start);
        let hi = self.end().min(start.saturating_add(len));
        (lo < hi).then(|| Extent::new(lo, hi - lo))
    }

    /// Rebase an extent from one coordinate space into another (`start - from + to`).
    pub fn shifted(&self, base_from: u64, base_to: u64) -> Extent {
        Extent::new(self.start - base_from + base_to, self.length)
    }

    fn overlaps_or_adjacent(&self, other: &Extent) -> bool {
        self.start <= other.end() && other.start <= self.end()
    }

    fn merge(&self, other: &Extent) -> Extent {
        let start = self.start.min(other.start);
        Extent::new(start, self.end().max(other.end()) - start)
    }
}

/// A set of disjoint, sorted extents.
///
/// Invariants:
/// - Extents are stored in ascending order.
/// - No extents overlap or touch (adjacent extents are merged).
/// - No extent is empty.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtentSet {
    extents: Vec<Extent>,
}

impl ExtentSet {
    pub fn new() -> Self {
        Self {
            extents: Vec::new(),
        }
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn into_vec(self) -> Vec<Extent> {
        self.extents
    }

    pub fn total_len(&self) -> u64 {
        self.extents.iter().map(|e| e.length).sum()
    }

    pub fn contains_range(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        let idx = match self.extents.binary_search_by(|e| {
            if e.end() <= start {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }) {
            Ok(idx) | Err(idx) => idx,
        };
        self.extents
            .get(idx)
            .is_some_and(|e| e.start <= start && e.end() >= end)
    }

    /// Insert an extent, merging overlapping/adjacent extents.
    pub fn insert(&mut self, extent: Extent) {
        if extent.is_empty() {
            return;
        }

        // Fast path: enumeration results usually arrive in ascending order.
        if let Some(last) = self.extents.last_mut() {
            if last.end() <= extent.start {
                if last.end() == extent.start {
                    *last = last.merge(&extent);
                } else {
                    self.extents.push(extent);
                }
                return;
            }
        } else {
            self.extents.push(extent);
            return;
        }

        let mut new = extent;
        let mut out = Vec::with_capacity(self.extents.len() + 1);
        let mut inserted = false;
        for e in self.extents.drain(..) {
            if e.overlaps_or_adjacent(&new) {
                new = new.merge(&e);
                continue;
            }
            if e.end() < new.start {
                out.push(e);
                continue;
            }
            if !inserted {
                out.push(new);
                inserted = true;
            }
            out.push(e);
        }
        if !inserted {
            out.push(new);
        }
        self.extents = out;
    }

    /// Remove a range from the set, splitting extents as needed.
    pub fn remove(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut out = Vec::with_capacity(self.extents.len() + 1);
        for e in self.extents.drain(..) {
            if e.end() <= start || e.start >= end {
                out.push(e);
                continue;
            }
            if e.start < start {
                out.push(Extent::new(e.start, start - e.start));
            }
            if e.end() > end {
                out.push(Extent::new(end, e.end() - end));
            }
        }
        self.extents = out;
    }

    pub(crate) fn overlaps_any(&self, other: &Extent) -> bool {
        self.extents
            .iter()
            .any(|e| e.start < other.end() && other.start < e.end())
    }
}

impl FromIterator<Extent> for ExtentSet {
    fn from_iter<I: IntoIterator<Item = Extent>>(iter: I) -> Self {
        let mut set = ExtentSet::new();
        for e in iter {
            set.insert(e);
        }
        set
    }
}
