//! Wrap-safe 16-bit sequence numbers and the coalesced gap set used by the
//! reliable stream for negative acknowledgement.
//!
//! Sequence comparison is always performed through signed wraparound
//! distance: two sequence numbers whose true distance is within half the
//! numeric range order consistently regardless of wrap. Raw unsigned
//! comparison is never used.

/// A 16-bit sequence number with wraparound arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Seq(pub u16);

impl Seq {
    pub const ZERO: Seq = Seq(0);

    #[inline]
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Signed distance from `self` to `other`. Positive when `other` is
    /// ahead of `self`, valid while the true distance is < 32768.
    #[inline]
    pub fn delta(self, other: Seq) -> i16 {
        other.0.wrapping_sub(self.0) as i16
    }

    /// True when `self` orders strictly before `other` under wraparound.
    #[inline]
    pub fn precedes(self, other: Seq) -> bool {
        self.delta(other) > 0
    }

    #[inline]
    pub fn next(self) -> Seq {
        Seq(self.0.wrapping_add(1))
    }

    #[inline]
    pub fn add(self, n: u16) -> Seq {
        Seq(self.0.wrapping_add(n))
    }
}

impl From<u16> for Seq {
    fn from(v: u16) -> Self {
        Seq(v)
    }
}

/// A coalesced set of missing sequence-number ranges (inclusive).
///
/// All ranges are assumed to lie inside one receive window, which spans
/// less than half the sequence space, so `Seq::precedes` gives a total
/// order over everything stored here.
#[derive(Clone, Debug, Default)]
pub struct GapSet {
    /// Sorted by range start, non-overlapping, non-adjacent.
    ranges: Vec<(Seq, Seq)>,
}

impl GapSet {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[(Seq, Seq)] {
        &self.ranges
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn contains(&self, seq: Seq) -> bool {
        self.ranges
            .iter()
            .any(|&(s, e)| !seq.precedes(s) && !e.precedes(seq))
    }

    /// Add the inclusive range `[start, end]`, merging with any existing
    /// range it touches or abuts.
    pub fn add(&mut self, start: Seq, end: Seq) {
        debug_assert!(!end.precedes(start), "inverted gap range");
        let mut new_start = start;
        let mut new_end = end;
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut inserted = false;

        for &(s, e) in &self.ranges {
            if e.next().precedes(new_start) {
                // Entirely before the new range, not adjacent.
                merged.push((s, e));
            } else if new_end.next().precedes(s) {
                // Entirely after: emit the new range first if not done.
                if !inserted {
                    merged.push((new_start, new_end));
                    inserted = true;
                }
                merged.push((s, e));
            } else {
                // Overlapping or adjacent: absorb.
                if s.precedes(new_start) {
                    new_start = s;
                }
                if new_end.precedes(e) {
                    new_end = e;
                }
            }
        }
        if !inserted {
            merged.push((new_start, new_end));
        }
        self.ranges = merged;
    }

    /// Remove a single sequence number, splitting its range if needed.
    pub fn remove(&mut self, seq: Seq) {
        let Some(idx) = self
            .ranges
            .iter()
            .position(|&(s, e)| !seq.precedes(s) && !e.precedes(seq))
        else {
            return;
        };
        let (s, e) = self.ranges[idx];
        match (s == seq, e == seq) {
            (true, true) => {
                self.ranges.remove(idx);
            }
            (true, false) => self.ranges[idx] = (s.next(), e),
            (false, true) => self.ranges[idx] = (s, Seq(e.0.wrapping_sub(1))),
            (false, false) => {
                self.ranges[idx] = (s, Seq(seq.0.wrapping_sub(1)));
                self.ranges.insert(idx + 1, (seq.next(), e));
            }
        }
    }

    /// Drop every range that orders entirely before `seq`, and clip any
    /// range straddling it. Used when the receive window advances.
    pub fn remove_before(&mut self, seq: Seq) {
        self.ranges.retain_mut(|r| {
            if r.1.precedes(seq) {
                return false;
            }
            if r.0.precedes(seq) {
                r.0 = seq;
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_agrees_across_wrap() {
        let cases = [
            (Seq(0), Seq(1)),
            (Seq(100), Seq(30_000)),
            (Seq(65_535), Seq(0)),
            (Seq(65_000), Seq(200)),
            (Seq(32_767), Seq(32_768)),
        ];
        for (a, b) in cases {
            assert!(a.precedes(b), "{a:?} should precede {b:?}");
            assert!(!b.precedes(a), "{b:?} should not precede {a:?}");
            assert!(a.delta(b) > 0);
            assert!(b.delta(a) < 0);
        }
    }

    #[test]
    fn not_before_self() {
        let s = Seq(4242);
        assert!(!s.precedes(s));
        assert_eq!(s.delta(s), 0);
    }

    #[test]
    fn increment_full_cycle_returns_to_origin() {
        let start = Seq(12_345);
        let mut s = start;
        for _ in 0..65_536u32 {
            s = s.next();
        }
        assert_eq!(s, start);
    }

    #[test]
    fn gapset_add_then_remove_each_leaves_empty() {
        let mut gaps = GapSet::new();
        gaps.add(Seq(10), Seq(20));
        for raw in 10..=20u16 {
            assert!(gaps.contains(Seq(raw)));
            gaps.remove(Seq(raw));
        }
        assert!(gaps.is_empty());
    }

    #[test]
    fn gapset_remove_middle_splits() {
        let mut gaps = GapSet::new();
        gaps.add(Seq(5), Seq(9));
        gaps.remove(Seq(7));
        assert_eq!(gaps.ranges(), &[(Seq(5), Seq(6)), (Seq(8), Seq(9))]);
        assert!(!gaps.contains(Seq(7)));
    }

    #[test]
    fn gapset_adjacent_ranges_coalesce() {
        let mut gaps = GapSet::new();
        gaps.add(Seq(5), Seq(9));
        gaps.add(Seq(10), Seq(14));
        assert_eq!(gaps.ranges(), &[(Seq(5), Seq(14))]);

        let mut gaps = GapSet::new();
        gaps.add(Seq(10), Seq(14));
        gaps.add(Seq(5), Seq(9));
        assert_eq!(gaps.ranges(), &[(Seq(5), Seq(14))]);
    }

    #[test]
    fn gapset_overlap_absorbs() {
        let mut gaps = GapSet::new();
        gaps.add(Seq(5), Seq(9));
        gaps.add(Seq(8), Seq(30));
        gaps.add(Seq(1), Seq(6));
        assert_eq!(gaps.ranges(), &[(Seq(1), Seq(30))]);
    }

    #[test]
    fn gapset_across_wrap_boundary() {
        let mut gaps = GapSet::new();
        gaps.add(Seq(65_534), Seq(2));
        assert!(gaps.contains(Seq(65_535)));
        assert!(gaps.contains(Seq(0)));
        gaps.remove(Seq(0));
        assert_eq!(
            gaps.ranges(),
            &[(Seq(65_534), Seq(65_535)), (Seq(1), Seq(2))]
        );
    }

    #[test]
    fn gapset_remove_before_clips_and_drops() {
        let mut gaps = GapSet::new();
        gaps.add(Seq(5), Seq(9));
        gaps.add(Seq(20), Seq(25));
        gaps.remove_before(Seq(8));
        assert_eq!(gaps.ranges(), &[(Seq(8), Seq(9)), (Seq(20), Seq(25))]);
        gaps.remove_before(Seq(30));
        assert!(gaps.is_empty());
    }
}
