// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

const BITS_PER_WORD: usize = 64;

/// A per-page bitmap over a RAM block, stored as 64-bit words so whole words
/// can be shipped in discard messages.
#[derive(Clone, Debug)]
pub struct PageBitmap {
    words: Vec<u64>,
    num_pages: usize,
}

impl PageBitmap {
    pub fn new(num_pages: usize) -> PageBitmap {
        PageBitmap {
            words: vec![0; (num_pages + BITS_PER_WORD - 1) / BITS_PER_WORD],
            num_pages,
        }
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn set(&mut self, page: usize) {
        assert!(page < self.num_pages);
        self.words[page / BITS_PER_WORD] |= 1 << (page % BITS_PER_WORD);
    }

    pub fn clear(&mut self, page: usize) {
        assert!(page < self.num_pages);
        self.words[page / BITS_PER_WORD] &= !(1 << (page % BITS_PER_WORD));
    }

    pub fn is_set(&self, page: usize) -> bool {
        assert!(page < self.num_pages);
        self.words[page / BITS_PER_WORD] & (1 << (page % BITS_PER_WORD)) != 0
    }

    pub fn set_range(&mut self, start: usize, len: usize) {
        for page in start..start + len {
            self.set(page);
        }
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates the non-zero words as `(word_index, word)` pairs, the unit
    /// the discard wire encoding works in.
    pub fn set_words(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.words
            .iter()
            .enumerate()
            .filter(|(_, w)| **w != 0)
            .map(|(i, w)| (i as u64, *w))
    }
}
