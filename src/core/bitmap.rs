// Copyright 2025 Stoolap Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-width bitmaps over field or attribute ordinals
//!
//! Used for the server read/write sets, per-key field masks and the
//! attribute masks handed to cluster operations.

use smallvec::{smallvec, SmallVec};

const WORD_BITS: usize = 64;

/// A bitmap with a fixed number of bits
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldBitmap {
    words: SmallVec<[u64; 2]>,
    len: usize,
}

impl FieldBitmap {
    /// Create an empty bitmap of `len` bits
    pub fn new(len: usize) -> Self {
        let words = len.div_ceil(WORD_BITS);
        Self {
            words: smallvec![0; words],
            len,
        }
    }

    /// Create a bitmap with all `len` bits set
    pub fn all(len: usize) -> Self {
        let mut bm = Self::new(len);
        bm.set_all();
        bm
    }

    /// Create a bitmap of `len` bits with the given bits set
    pub fn from_bits(len: usize, bits: &[usize]) -> Self {
        let mut bm = Self::new(len);
        for &b in bits {
            bm.set(b);
        }
        bm
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set(&mut self, bit: usize) {
        if bit < self.len {
            self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        }
    }

    #[inline]
    pub fn clear(&mut self, bit: usize) {
        if bit < self.len {
            self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
        }
    }

    #[inline]
    pub fn is_set(&self, bit: usize) -> bool {
        bit < self.len && self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    pub fn set_all(&mut self) {
        for w in self.words.iter_mut() {
            *w = u64::MAX;
        }
        self.trim_tail();
    }

    pub fn clear_all(&mut self) {
        for w in self.words.iter_mut() {
            *w = 0;
        }
    }

    pub fn is_clear_all(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn is_set_all(&self) -> bool {
        self.count() == self.len
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// `self |= other`
    pub fn union_with(&mut self, other: &FieldBitmap) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= *b;
        }
        self.trim_tail();
    }

    /// `self &= !other`
    pub fn subtract(&mut self, other: &FieldBitmap) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a &= !*b;
        }
    }

    /// `self &= other`
    pub fn intersect(&mut self, other: &FieldBitmap) {
        for (i, a) in self.words.iter_mut().enumerate() {
            *a &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    /// True when any bit is set in both bitmaps
    pub fn overlaps(&self, other: &FieldBitmap) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// True when every bit of `self` is also set in `other`
    pub fn is_subset_of(&self, other: &FieldBitmap) -> bool {
        self.words
            .iter()
            .enumerate()
            .all(|(i, a)| a & !other.words.get(i).copied().unwrap_or(0) == 0)
    }

    /// Iterate the set bit positions in ascending order
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&b| self.is_set(b))
    }

    fn trim_tail(&mut self) {
        let rem = self.len % WORD_BITS;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear() {
        let mut bm = FieldBitmap::new(70);
        assert!(bm.is_clear_all());
        bm.set(0);
        bm.set(69);
        bm.set(70); // out of range, ignored
        assert!(bm.is_set(0));
        assert!(bm.is_set(69));
        assert!(!bm.is_set(70));
        assert_eq!(bm.count(), 2);
        bm.clear(0);
        assert_eq!(bm.iter_set().collect::<Vec<_>>(), vec![69]);
    }

    #[test]
    fn test_all_trims_tail() {
        let bm = FieldBitmap::all(3);
        assert_eq!(bm.count(), 3);
        assert!(bm.is_set_all());
    }

    #[test]
    fn test_set_algebra() {
        let a = FieldBitmap::from_bits(8, &[0, 1, 2]);
        let b = FieldBitmap::from_bits(8, &[2, 3]);
        assert!(a.overlaps(&b));

        let mut u = a.clone();
        u.union_with(&b);
        assert_eq!(u.iter_set().collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        let mut d = a.clone();
        d.subtract(&b);
        assert_eq!(d.iter_set().collect::<Vec<_>>(), vec![0, 1]);
        assert!(!d.overlaps(&b));

        let mut i = a.clone();
        i.intersect(&b);
        assert_eq!(i.iter_set().collect::<Vec<_>>(), vec![2]);
        assert!(i.is_subset_of(&a));
        assert!(!a.is_subset_of(&b));
    }
}
