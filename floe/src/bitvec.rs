//! Concurrent growable bit vectors.

use {
    crate::{
        AllocationError,
        ArrayOptions,
        DEFAULT_FIRST_BUCKET_SIZE,
        IndexError,
        RelaxedLog,
        Result,
    },
    std::ops::Range,
};

const WORD_BITS: usize = u64::BITS as usize;

/// Mask with the bits `lo .. hi` set.
///
/// Requires `lo <= hi <= 64`.
pub fn range_mask(lo: usize, hi: usize) -> u64
{
    debug_assert!(lo <= hi && hi <= WORD_BITS);
    match hi - lo {
        0 => 0,
        WORD_BITS => !0,
        width => ((1 << width) - 1) << lo,
    }
}

/// Bit vector over a relaxed log of 64-bit words.
///
/// Setting a bit grows the vector to cover it.
/// Bits are only ever set or cleared with atomic read-modify-write
/// operations on their word, so concurrent updates to bits that share
/// a word never lose each other.
pub struct BitVector<const F: usize = DEFAULT_FIRST_BUCKET_SIZE>
{
    words: RelaxedLog<u64, F>,
}

impl<const F: usize> BitVector<F>
{
    /// Create an empty in-memory bit vector.
    pub fn new() -> Self
    {
        Self{words: RelaxedLog::new()}
    }

    /// Create an empty bit vector with the given options.
    pub fn with_options(options: &ArrayOptions) -> Result<Self, AllocationError>
    {
        Ok(Self{words: RelaxedLog::with_options(options)?})
    }

    /// Number of bits covered, always a multiple of 64.
    pub fn len(&self) -> usize
    {
        self.words.size().saturating_mul(WORD_BITS)
    }

    /// Whether no bits are covered.
    pub fn is_empty(&self) -> bool
    {
        self.words.size() == 0
    }

    /// Maximum number of bits.
    pub fn capacity(&self) -> usize
    {
        self.words.capacity().saturating_mul(WORD_BITS)
    }

    /// The underlying log of words.
    pub fn words(&self) -> &RelaxedLog<u64, F>
    {
        &self.words
    }

    /// Grow the vector to cover the bits in `bits`,
    /// returning the range of words they occupy.
    ///
    /// The bucket of the last word is installed before the length grows,
    /// so a failed allocation leaves the length unchanged.
    fn cover(&self, bits: Range<usize>) -> Result<Range<usize>>
    {
        let capacity = self.capacity();
        if bits.end > capacity {
            return Err(IndexError{index: bits.end - 1, bound: capacity}.into());
        }
        let words = bits.start / WORD_BITS .. (bits.end - 1) / WORD_BITS + 1;
        self.words.get(words.end - 1)?;
        self.words.ensure_size(words.end);
        Ok(words)
    }

    /// Set bit `bit`.
    pub fn set_bit(&self, bit: usize) -> Result<()>
    {
        let words = self.cover(bit .. bit.saturating_add(1))?;
        self.words.fetch_or(words.start, 1 << (bit % WORD_BITS))?;
        Ok(())
    }

    /// Set the `count` bits starting at `start`.
    ///
    /// Each word is updated with a single atomic OR.
    pub fn set_bits(&self, start: usize, count: usize) -> Result<()>
    {
        if count == 0 {
            return Ok(());
        }
        let end = start.checked_add(count)
            .ok_or(IndexError{index: usize::MAX, bound: self.capacity()})?;
        let words = self.cover(start .. end)?;

        let first = words.start;
        let last = words.end - 1;
        for word in words {
            let lo = if word == first { start % WORD_BITS } else { 0 };
            let hi = if word == last { (end - 1) % WORD_BITS + 1 } else { WORD_BITS };
            self.words.fetch_or(word, range_mask(lo, hi))?;
        }

        tracing::trace!(start, count, "Set bit run");
        Ok(())
    }

    /// Clear bit `bit`.
    ///
    /// Bits beyond the current length are already clear.
    pub fn clear_bit(&self, bit: usize) -> Result<()>
    {
        let word = bit / WORD_BITS;
        if word < self.words.size() {
            self.words.fetch_and(word, !(1 << (bit % WORD_BITS)))?;
        }
        Ok(())
    }

    /// Read a word below the length.
    ///
    /// A missing bucket is installed, which reattaches file-backed words.
    /// Words that cannot be read are treated as zero.
    fn word(&self, word: usize) -> u64
    {
        self.words.peek(word)
            .or_else(|| self.words.get(word).ok())
            .unwrap_or(0)
    }

    /// Whether bit `bit` is set.
    ///
    /// Bits beyond the current length read as unset. Never blocks.
    pub fn get_bit(&self, bit: usize) -> bool
    {
        let word = bit / WORD_BITS;
        if word >= self.words.size() {
            return false;
        }
        self.word(word) & 1 << (bit % WORD_BITS) != 0
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize
    {
        (0 .. self.words.size())
            .map(|word| self.word(word).count_ones() as usize)
            .sum()
    }
}

impl<const F: usize> Default for BitVector<F>
{
    fn default() -> Self
    {
        Self::new()
    }
}
