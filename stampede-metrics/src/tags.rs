use crate::key::KeyId;
use smallvec::SmallVec;

/// An immutable set of tag pairs in canonical order. Canonicalizing at
/// construction (sort + dedup) is what makes equal tag sets hash equal, so
/// they can key series storage directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagSet {
    // Samples rarely carry more than a handful of tags; keep them inline.
    pairs: SmallVec<[(KeyId, KeyId); 4]>,
}

impl TagSet {
    pub fn new(pairs: impl IntoIterator<Item = (KeyId, KeyId)>) -> Self {
        let mut pairs: SmallVec<[(KeyId, KeyId); 4]> = pairs.into_iter().collect();
        pairs.sort_unstable();
        pairs.dedup();
        TagSet { pairs }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (KeyId, KeyId)> + '_ {
        self.pairs.iter().copied()
    }

    pub fn value_of(&self, key: KeyId) -> Option<KeyId> {
        self.pairs
            .iter()
            .find_map(|&(k, v)| (k == key).then_some(v))
    }

    /// True when every pair of `self` also appears in `other`. Both sides
    /// are canonically ordered, so one forward walk over `other` suffices.
    pub fn subset_of(&self, other: &TagSet) -> bool {
        let mut remaining = other.pairs.as_slice();
        self.pairs.iter().all(|needle| {
            match remaining.iter().position(|pair| pair == needle) {
                Some(found) => {
                    remaining = &remaining[found + 1..];
                    true
                }
                None => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(k: u32, v: u32) -> (KeyId, KeyId) {
        (KeyId::from(k), KeyId::from(v))
    }

    #[test]
    fn construction_canonicalizes_order_and_duplicates() {
        let unordered = TagSet::new([pair(3, 0), pair(1, 2), pair(3, 0)]);
        let ordered = TagSet::new([pair(1, 2), pair(3, 0)]);
        assert_eq!(unordered, ordered);
        assert_eq!(unordered.iter().count(), 2);
    }

    #[test]
    fn value_lookup_honours_the_key_only() {
        let set = TagSet::new([pair(1, 2), pair(3, 0)]);
        assert_eq!(set.value_of(KeyId::from(1)), Some(KeyId::from(2)));
        assert_eq!(set.value_of(KeyId::from(3)), Some(KeyId::from(0)));
        assert_eq!(set.value_of(KeyId::from(2)), None);
    }

    #[test]
    fn subset_checks_pairs_not_keys() {
        let selector = TagSet::new([pair(1, 2)]);
        let sample_tags = TagSet::new([pair(1, 2), pair(3, 0)]);
        let wrong_value = TagSet::new([pair(1, 9), pair(3, 0)]);

        assert!(selector.subset_of(&sample_tags));
        assert!(!selector.subset_of(&wrong_value));
        assert!(!sample_tags.subset_of(&selector));
        assert!(TagSet::default().subset_of(&selector));
    }
}
