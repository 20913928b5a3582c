//! Bitmap of object numbers

use osdflow_common::ObjectNo;
use serde::{Deserialize, Serialize};
use std::fmt;

const WORD_BITS: u64 = u64::BITS as u64;

/// Set of object numbers of one file
///
/// Stored as a bitmap, since object sets of an OSD are mostly dense.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ObjectSet {
    words: Vec<u64>,
    len: usize,
}

#[allow(clippy::cast_possible_truncation)]
const fn slot(object_no: ObjectNo) -> (usize, u64) {
    ((object_no / WORD_BITS) as usize, 1 << (object_no % WORD_BITS))
}

impl ObjectSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, object_no: ObjectNo) -> bool {
        let (word, bit) = slot(object_no);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    /// Add an object; returns `false` if it was already present
    pub fn add(&mut self, object_no: ObjectNo) -> bool {
        let (word, bit) = slot(object_no);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        if self.words[word] & bit != 0 {
            return false;
        }
        self.words[word] |= bit;
        self.len += 1;
        true
    }

    /// Remove an object; returns `false` if it was not present
    pub fn remove(&mut self, object_no: ObjectNo) -> bool {
        let (word, bit) = slot(object_no);
        match self.words.get_mut(word) {
            Some(w) if *w & bit != 0 => {
                *w &= !bit;
                self.len -= 1;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.len = 0;
    }

    /// Smallest object number in the set
    #[must_use]
    pub fn first(&self) -> Option<ObjectNo> {
        self.iter().next()
    }

    /// Object numbers in ascending order
    pub fn iter(&self) -> impl Iterator<Item = ObjectNo> + '_ {
        self.words.iter().enumerate().flat_map(|(index, &word)| {
            let base = index as u64 * WORD_BITS;
            (0..WORD_BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| base + bit)
        })
    }
}

impl FromIterator<ObjectNo> for ObjectSet {
    fn from_iter<I: IntoIterator<Item = ObjectNo>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl Extend<ObjectNo> for ObjectSet {
    fn extend<I: IntoIterator<Item = ObjectNo>>(&mut self, iter: I) {
        for object_no in iter {
            self.add(object_no);
        }
    }
}

impl PartialEq for ObjectSet {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl Eq for ObjectSet {}

impl fmt::Debug for ObjectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
