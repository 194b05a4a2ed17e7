//! A growable set of node ids.
//!
//! Stored as a little-endian bit vector over bytes, so the wire form is a
//! plain byte array whose bit `i` says whether node `i` is a member.  The
//! bit length is always a multiple of eight and only ever grows: `add` and
//! `flip` past the end extend the set, `remove` past the end is a no-op.
//!
//! Members can also be treated as a sorted ring, see
//! [`NodeIdSet::neighbors_of`].

use {
    bitvec::{order::Lsb0, vec::BitVec},
    serde::{Deserialize, Serialize},
    std::fmt,
};

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<u8>", into = "Vec<u8>")]
pub struct NodeIdSet {
    bits: BitVec<u8, Lsb0>,
}

impl NodeIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty set with room for ids `0..bits` without growing.
    pub fn with_capacity(bits: usize) -> Self {
        let mut set = Self::new();
        set.ensure(bits);
        set
    }

    /// Build a set from raw bytes, bit `i` of the stream being node `i`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bits: BitVec::from_vec(bytes.to_vec()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.as_raw_slice().to_vec()
    }

    /// Bit length of the backing store, always a multiple of 8.
    pub fn size(&self) -> usize {
        self.bits.len()
    }

    /// Number of members.
    pub fn cardinality(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn contains(&self, id: u16) -> bool {
        let idx = usize::from(id);
        idx < self.bits.len() && self.bits[idx]
    }

    /// Add `id`, returning true when it was not already a member.
    pub fn add(&mut self, id: u16) -> bool {
        let idx = usize::from(id);
        self.ensure(idx.saturating_add(1));
        let was = self.bits[idx];
        self.bits.set(idx, true);
        !was
    }

    /// Remove `id`, returning true when it was a member.
    pub fn remove(&mut self, id: u16) -> bool {
        let idx = usize::from(id);
        if idx >= self.bits.len() {
            return false;
        }
        let was = self.bits[idx];
        self.bits.set(idx, false);
        was
    }

    /// Toggle membership of `id`; returns the new membership.
    pub fn flip(&mut self, id: u16) -> bool {
        let idx = usize::from(id);
        self.ensure(idx.saturating_add(1));
        let now = !self.bits[idx];
        self.bits.set(idx, now);
        now
    }

    pub fn clear(&mut self) {
        self.bits.fill(false);
    }

    /// In-place union.
    pub fn merge(&mut self, other: &NodeIdSet) {
        self.ensure(other.size());
        for (mine, theirs) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *mine |= *theirs;
        }
    }

    /// In-place intersection.
    pub fn intersect(&mut self, other: &NodeIdSet) {
        let theirs = other.bits.as_raw_slice();
        for (i, mine) in self.bits.as_raw_mut_slice().iter_mut().enumerate() {
            *mine &= theirs.get(i).copied().unwrap_or(0);
        }
    }

    /// In-place difference: drop every member of `other`.
    pub fn subtract(&mut self, other: &NodeIdSet) {
        for (mine, theirs) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *mine &= !*theirs;
        }
    }

    pub fn union(&self, other: &NodeIdSet) -> NodeIdSet {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn intersection(&self, other: &NodeIdSet) -> NodeIdSet {
        let mut out = self.clone();
        out.intersect(other);
        out
    }

    pub fn difference(&self, other: &NodeIdSet) -> NodeIdSet {
        let mut out = self.clone();
        out.subtract(other);
        out
    }

    pub fn contains_all(&self, other: &NodeIdSet) -> bool {
        other.difference(self).is_empty()
    }

    /// Member ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.bits.iter_ones().filter_map(|idx| u16::try_from(idx).ok())
    }

    pub fn first(&self) -> Option<u16> {
        self.bits.first_one().and_then(|idx| u16::try_from(idx).ok())
    }

    pub fn last(&self) -> Option<u16> {
        self.bits.last_one().and_then(|idx| u16::try_from(idx).ok())
    }

    /// Smallest member strictly greater than `id`.
    pub fn next_after(&self, id: u16) -> Option<u16> {
        let start = usize::from(id).saturating_add(1);
        if start >= self.bits.len() {
            return None;
        }
        self.bits[start..]
            .first_one()
            .and_then(|offset| u16::try_from(offset.saturating_add(start)).ok())
    }

    /// Largest member strictly smaller than `id`.
    pub fn prev_before(&self, id: u16) -> Option<u16> {
        let end = usize::from(id).min(self.bits.len());
        self.bits[..end]
            .last_one()
            .and_then(|idx| u16::try_from(idx).ok())
    }

    /// The members on either side of `id` on the sorted ring of members,
    /// wrapping at both ends.  `None` when the set is empty.
    pub fn neighbors_of(&self, id: u16) -> Option<(u16, u16)> {
        let lower = self.prev_before(id).or_else(|| self.last())?;
        let upper = self.next_after(id).or_else(|| self.first())?;
        Some((lower, upper))
    }

    fn ensure(&mut self, bits: usize) {
        if bits > self.bits.len() {
            let rounded = bits.div_ceil(8).saturating_mul(8);
            self.bits.resize(rounded, false);
        }
    }
}

impl From<Vec<u8>> for NodeIdSet {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bits: BitVec::from_vec(bytes),
        }
    }
}

impl From<NodeIdSet> for Vec<u8> {
    fn from(set: NodeIdSet) -> Self {
        set.bits.into_vec()
    }
}

impl FromIterator<u16> for NodeIdSet {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut set = NodeIdSet::new();
        for id in iter {
            set.add(id);
        }
        set
    }
}

// Membership equality: trailing empty bytes do not matter.
impl PartialEq for NodeIdSet {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for NodeIdSet {}

impl fmt::Debug for NodeIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, test_case::test_case};

    fn every_third() -> NodeIdSet {
        (0..100u16).step_by(3).collect()
    }

    #[test]
    fn test_grows_in_whole_bytes() {
        let mut set = NodeIdSet::new();
        assert_eq!(set.size(), 0);
        assert!(set.add(0));
        assert_eq!(set.size(), 8);
        assert!(set.add(8));
        assert_eq!(set.size(), 16);
        assert!(!set.add(8));
        assert!(set.flip(100));
        assert_eq!(set.size(), 104);
        assert!(!set.remove(2000));
        assert_eq!(set.size(), 104);
        assert_eq!(set.cardinality(), 3);
    }

    #[test]
    fn test_flip_and_remove() {
        let mut set = NodeIdSet::new();
        assert!(set.flip(5));
        assert!(set.contains(5));
        assert!(!set.flip(5));
        assert!(!set.contains(5));
        set.add(6);
        assert!(set.remove(6));
        assert!(set.is_empty());
    }

    #[test]
    fn test_set_algebra() {
        let a: NodeIdSet = [1u16, 2, 3, 40].into_iter().collect();
        let b: NodeIdSet = [3u16, 4, 200].into_iter().collect();

        assert_eq!(a.union(&b).iter().collect::<Vec<_>>(), vec![1, 2, 3, 4, 40, 200]);
        assert_eq!(a.intersection(&b).iter().collect::<Vec<_>>(), vec![3]);
        assert_eq!(a.difference(&b).iter().collect::<Vec<_>>(), vec![1, 2, 40]);
        assert_eq!(b.difference(&a).iter().collect::<Vec<_>>(), vec![4, 200]);
        assert!(a.union(&b).contains_all(&a));
        assert!(!a.contains_all(&b));
    }

    #[test_case(0, (99, 3); "wraps below the first member")]
    #[test_case(99, (96, 0); "wraps above the last member")]
    #[test_case(48, (45, 51); "interior member")]
    #[test_case(50, (48, 51); "non member")]
    fn test_ring_neighbors(id: u16, expected: (u16, u16)) {
        assert_eq!(every_third().neighbors_of(id), Some(expected));
    }

    #[test]
    fn test_ring_degenerate() {
        assert_eq!(NodeIdSet::new().neighbors_of(3), None);
        let single: NodeIdSet = [7u16].into_iter().collect();
        assert_eq!(single.neighbors_of(7), Some((7, 7)));
        assert_eq!(single.neighbors_of(1000), Some((7, 7)));
    }

    #[test]
    fn test_bytes_and_serde() {
        let set = every_third();
        let bytes = set.to_bytes();
        assert_eq!(bytes.len(), set.size() / 8);
        assert_eq!(bytes[0], 0b0100_1001);
        assert_eq!(NodeIdSet::from_bytes(&bytes), set);

        let encoded = bincode::serialize(&set).unwrap();
        let decoded: NodeIdSet = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, set);
    }
}
