use std::{
    mem,
    ptr::NonNull,
    slice,
    sync::{Mutex, MutexGuard},
};

use log::trace;

use crate::{platform, round::round_up, Pointer};

/// Number of machine words in the process-wide scratch buffer. 16 KiB on 64
/// bit machines, which covers the page maps of all the common size class
/// geometries without touching `mmap` at all.
const STATIC_BUFFER_WORDS: usize = 2048;

/// Process-wide scratch buffer for small page maps. Arbitrated with
/// [`Mutex::try_lock`] only: if another release pass currently owns it, the
/// new map silently falls back to a kernel mapping instead of blocking.
static STATIC_BUFFER: Mutex<[usize; STATIC_BUFFER_WORDS]> =
    Mutex::new([0; STATIC_BUFFER_WORDS]);

/// Backing storage of a [`PackedPageMap`].
enum Buffer {
    /// Borrowed process-wide scratch buffer. Keeping the guard here keeps
    /// the lock held for exactly as long as the map is alive, so dropping
    /// the map hands the buffer to the next release pass.
    Static(MutexGuard<'static, [usize; STATIC_BUFFER_WORDS]>),
    /// Kernel-mapped fallback. The second field is the mapped length in
    /// bytes (buffer size rounded up to the page size), needed to return
    /// the memory later.
    Mapped(NonNull<usize>, usize),
}

/// A page map records, for every page of every region, how many free blocks
/// overlap that page. It is a dense two-dimensional array of counters, where
/// each counter occupies the smallest power-of-two number of bits that fits
/// `max_value`, packed into machine words:
///
/// ```text
///                   counter (region 0, page 2)
///                              |
///             +-----+-----+-----+-----+- ... -+-----+
/// region 0    |  c0 |  c1 |  c2 |  c3 |       | c15 |   <- one 64 bit word,
///             +-----+-----+-----+-----+- ... -+-----+      sixteen 4 bit
///             |  c16 ...                             |      counters
///             +--------------------------------------+
/// region 1    |  c0 ...                              |   <- each region
///             +--------------------------------------+      starts on a
///                              ...                          word boundary
/// ```
///
/// The all-ones value of a counter (`counter_mask`) is a sentinel meaning
/// *all counted*: enough free blocks were observed that the page is
/// certainly fully free. Pages can have different natural maxima (the first
/// and last page touched by a straddling block see one extra), so the
/// sentinel gives every page a single uniform "fully free" representation.
/// Once a counter reaches the sentinel it stays there.
///
/// Construction tries the static scratch buffer first and falls back to a
/// kernel mapping when the buffer is too small or already borrowed by
/// another pass. The fallback mapping may fail, so callers that didn't size
/// their map for the static buffer must check [`PackedPageMap::is_allocated`]
/// before using it.
///
/// For performance sake none of the accessors validate their arguments in
/// release builds. Indices are assumed to be in range and counters are
/// assumed to never be incremented past `counter_mask`.
pub struct PackedPageMap {
    regions: usize,
    counters_per_region: usize,
    counter_size_bits_log: u32,
    counter_mask: usize,
    packing_ratio_log: u32,
    bit_offset_mask: usize,
    /// Words per region, rounded up so each region starts on a word boundary.
    size_per_region: usize,
    /// Exact buffer size in bytes, before any page size rounding.
    buffer_size: usize,
    buffer: Option<Buffer>,
}

impl PackedPageMap {
    /// Builds a page map for `number_of_regions` regions of
    /// `counters_per_region` counters each, where every counter must be able
    /// to hold `max_value`. All counters start at zero.
    pub fn new(
        number_of_regions: usize,
        counters_per_region: usize,
        max_value: usize,
    ) -> Self {
        debug_assert!(number_of_regions > 0);
        debug_assert!(counters_per_region > 0);
        debug_assert!(max_value > 0);

        // Rounding the counter width up to a power of two lets us find a
        // counter's word and bit offset with shifts and masks only.
        let counter_size_bits =
            (usize::BITS - max_value.leading_zeros()).next_power_of_two();
        debug_assert!(counter_size_bits <= usize::BITS);
        let counter_mask = usize::MAX >> (usize::BITS - counter_size_bits);

        let packing_ratio = (usize::BITS / counter_size_bits) as usize;
        let size_per_region = counters_per_region.div_ceil(packing_ratio);
        let buffer_size =
            size_per_region * mem::size_of::<usize>() * number_of_regions;

        Self {
            regions: number_of_regions,
            counters_per_region,
            counter_size_bits_log: counter_size_bits.trailing_zeros(),
            counter_mask,
            packing_ratio_log: packing_ratio.trailing_zeros(),
            bit_offset_mask: packing_ratio - 1,
            size_per_region,
            buffer_size,
            buffer: Self::acquire_buffer(buffer_size),
        }
    }

    /// Grabs the static scratch buffer if it is big enough and currently
    /// free, otherwise maps a fresh zeroed buffer from the kernel. Never
    /// blocks: a busy scratch buffer means some other release pass owns it
    /// and we simply pay for a mapping instead.
    fn acquire_buffer(buffer_size: usize) -> Option<Buffer> {
        if buffer_size <= STATIC_BUFFER_WORDS * mem::size_of::<usize>() {
            if let Ok(mut guard) = STATIC_BUFFER.try_lock() {
                // The previous borrower left its counters behind.
                let words = buffer_size.div_ceil(mem::size_of::<usize>());
                guard[..words].fill(0);
                return Some(Buffer::Static(guard));
            }
        }

        let length = round_up(buffer_size, platform::page_size());
        trace!("page map falling back to a mapped buffer of {length} bytes");

        let address: Pointer<u8> = unsafe { platform::request_memory(length, true) };

        Some(Buffer::Mapped(address?.cast(), length))
    }

    /// Whether construction managed to get backing storage. A map without
    /// storage supports no other operation; the release pass that wanted it
    /// is expected to give up quietly.
    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }

    /// Number of counters in each region.
    pub fn counters_per_region(&self) -> usize {
        self.counters_per_region
    }

    /// Exact size of the counter buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// All-ones counter value used as the *all counted* sentinel.
    pub fn counter_mask(&self) -> usize {
        self.counter_mask
    }

    #[inline]
    fn words(&self) -> &[usize] {
        match &self.buffer {
            Some(Buffer::Static(guard)) => &guard[..],
            Some(Buffer::Mapped(address, length)) => unsafe {
                slice::from_raw_parts(address.as_ptr(), length / mem::size_of::<usize>())
            },
            None => &[],
        }
    }

    #[inline]
    fn words_mut(&mut self) -> &mut [usize] {
        match &mut self.buffer {
            Some(Buffer::Static(guard)) => &mut guard[..],
            Some(Buffer::Mapped(address, length)) => unsafe {
                slice::from_raw_parts_mut(address.as_ptr(), *length / mem::size_of::<usize>())
            },
            None => &mut [],
        }
    }

    /// Word index and bit offset of counter `i`.
    #[inline]
    fn locate(&self, region: usize, i: usize) -> (usize, usize) {
        debug_assert!(region < self.regions);
        debug_assert!(i < self.counters_per_region);

        let index = region * self.size_per_region + (i >> self.packing_ratio_log);
        let bit_offset = (i & self.bit_offset_mask) << self.counter_size_bits_log;

        (index, bit_offset)
    }

    /// Current value of the counter at (`region`, `i`).
    #[inline]
    pub fn get(&self, region: usize, i: usize) -> usize {
        let (index, bit_offset) = self.locate(region, i);
        let word = unsafe { *self.words().get_unchecked(index) };

        (word >> bit_offset) & self.counter_mask
    }

    /// Increments the counter at (`region`, `i`) by one. The counter must
    /// not be at its maximum yet.
    #[inline]
    pub fn inc(&mut self, region: usize, i: usize) {
        debug_assert!(self.get(region, i) < self.counter_mask);

        let (index, bit_offset) = self.locate(region, i);
        unsafe {
            *self.words_mut().get_unchecked_mut(index) += 1 << bit_offset;
        }
    }

    /// Increments the counter at (`region`, `i`) by `n`. The result must not
    /// exceed the counter's maximum.
    #[inline]
    pub fn inc_n(&mut self, region: usize, i: usize, n: usize) {
        debug_assert!(n > 0);
        debug_assert!(n <= self.counter_mask);
        debug_assert!(self.get(region, i) <= self.counter_mask - n);

        let (index, bit_offset) = self.locate(region, i);
        unsafe {
            *self.words_mut().get_unchecked_mut(index) += n << bit_offset;
        }
    }

    /// Increments every counter in the inclusive range [`from`, `to`],
    /// clamped to the number of counters in the region. Callers may pass a
    /// `to` beyond the last counter when a block overhangs the region end.
    pub fn inc_range(&mut self, region: usize, from: usize, to: usize) {
        debug_assert!(from <= to);

        let top = usize::min(to + 1, self.counters_per_region);
        for i in from..top {
            self.inc(region, i);
        }
    }

    /// Sets the counter at (`region`, `i`) to the *all counted* sentinel.
    /// The maximum number of blocks overlapping a page varies between pages,
    /// so pages that are known to be fully free are all stamped with the
    /// same sentinel instead of their individual maxima. Idempotent.
    #[inline]
    pub fn set_as_all_counted(&mut self, region: usize, i: usize) {
        debug_assert!(self.get(region, i) <= self.counter_mask);

        let (index, bit_offset) = self.locate(region, i);
        unsafe {
            *self.words_mut().get_unchecked_mut(index) |= self.counter_mask << bit_offset;
        }
    }

    /// [`Self::set_as_all_counted`] over the inclusive range [`from`, `to`],
    /// clamped like [`Self::inc_range`].
    pub fn set_as_all_counted_range(&mut self, region: usize, from: usize, to: usize) {
        debug_assert!(from <= to);

        let top = usize::min(to + 1, self.counters_per_region);
        for i in from..top {
            self.set_as_all_counted(region, i);
        }
    }

    /// Returns whether the page behind counter (`region`, `i`) is fully
    /// free, given that `max_count` blocks overlap it when nothing is
    /// allocated. A counter that reaches its page's natural maximum is
    /// promoted to the sentinel, so both "explicitly stamped" and "counted
    /// up to the maximum" read as fully free from here on.
    pub fn update_as_all_counted_if(
        &mut self,
        region: usize,
        i: usize,
        max_count: usize,
    ) -> bool {
        let count = self.get(region, i);

        if count == self.counter_mask {
            return true;
        }

        if count == max_count {
            self.set_as_all_counted(region, i);
            return true;
        }

        false
    }

    /// Whether the counter at (`region`, `i`) holds the sentinel.
    #[inline]
    pub fn is_all_counted(&self, region: usize, i: usize) -> bool {
        self.get(region, i) == self.counter_mask
    }
}

impl Drop for PackedPageMap {
    fn drop(&mut self) {
        // The static buffer unlocks itself when the guard drops, mapped
        // buffers have to be returned by hand.
        if let Some(Buffer::Mapped(address, length)) = self.buffer.take() {
            unsafe { platform::return_memory(address.cast(), length) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing_geometry() {
        // A maximum of 3 fits 2 value bits exactly, so 32 counters pack
        // into one 64 bit word. Note that the sentinel coincides with the
        // maximum here: reaching 3 already means fully free.
        let map = PackedPageMap::new(1, 100, 3);
        assert!(map.is_allocated());
        assert_eq!(map.counter_mask(), 0b11);
        assert_eq!(map.counters_per_region(), 100);
        if usize::BITS == 64 {
            assert_eq!(map.buffer_size(), 100usize.div_ceil(32) * 8);
        }

        // A maximum of 7 needs 3 value bits, rounded up to a 4 bit
        // counter, so 16 counters fit one 64 bit word.
        let map = PackedPageMap::new(1, 100, 7);
        assert_eq!(map.counter_mask(), 0b1111);
        if usize::BITS == 64 {
            assert_eq!(map.buffer_size(), 100usize.div_ceil(16) * 8);
        }

        // A maximum of 1 packs 64 one-bit counters per word.
        let map = PackedPageMap::new(1, 64, 1);
        assert_eq!(map.counter_mask(), 1);
        if usize::BITS == 64 {
            assert_eq!(map.buffer_size(), 8);
        }
    }

    #[test]
    fn counters_round_trip() {
        let mut map = PackedPageMap::new(3, 50, 5);
        assert!(map.is_allocated());

        // Everything starts zeroed.
        for region in 0..3 {
            for i in 0..50 {
                assert_eq!(map.get(region, i), 0);
            }
        }

        // Writing one counter must not disturb its neighbours in the same
        // word or the same page index in other regions.
        map.inc_n(1, 17, 5);
        assert_eq!(map.get(1, 17), 5);
        assert_eq!(map.get(1, 16), 0);
        assert_eq!(map.get(1, 18), 0);
        assert_eq!(map.get(0, 17), 0);
        assert_eq!(map.get(2, 17), 0);

        map.inc(1, 16);
        map.inc(1, 18);
        assert_eq!(map.get(1, 16), 1);
        assert_eq!(map.get(1, 17), 5);
        assert_eq!(map.get(1, 18), 1);
    }

    #[test]
    fn inc_range_is_inclusive_and_clamped() {
        let mut map = PackedPageMap::new(1, 10, 3);

        map.inc_range(0, 2, 4);
        assert_eq!(map.get(0, 1), 0);
        assert_eq!(map.get(0, 2), 1);
        assert_eq!(map.get(0, 3), 1);
        assert_eq!(map.get(0, 4), 1);
        assert_eq!(map.get(0, 5), 0);

        // A range overhanging the region end only touches real counters.
        map.inc_range(0, 8, 13);
        assert_eq!(map.get(0, 8), 1);
        assert_eq!(map.get(0, 9), 1);
    }

    #[test]
    fn all_counted_sentinel() {
        // A maximum of 5 lives in 4 bit counters, so the sentinel (15) is
        // distinguishable from the maximum.
        let mut map = PackedPageMap::new(1, 8, 5);

        // Counting up to the page's natural maximum is promoted to the
        // sentinel by the "is it fully free" check.
        map.inc_n(0, 0, 5);
        assert!(!map.is_all_counted(0, 0));
        assert!(map.update_as_all_counted_if(0, 0, 5));
        assert!(map.is_all_counted(0, 0));

        // Stamping directly and counting up read the same afterwards.
        map.set_as_all_counted(0, 1);
        assert!(map.is_all_counted(0, 1));
        assert!(map.update_as_all_counted_if(0, 1, 5));

        // Stamping an already stamped counter changes nothing.
        map.set_as_all_counted(0, 1);
        assert_eq!(map.get(0, 1), map.counter_mask());

        // A page that hasn't reached its maximum is not fully free.
        map.inc(0, 2);
        assert!(!map.update_as_all_counted_if(0, 2, 5));
        assert_eq!(map.get(0, 2), 1);

        // When the maximum fills its counter exactly, reaching it reads as
        // the sentinel on its own.
        let mut tight = PackedPageMap::new(1, 1, 3);
        tight.inc_n(0, 0, 3);
        assert!(tight.is_all_counted(0, 0));
        assert!(tight.update_as_all_counted_if(0, 0, 3));
    }

    #[test]
    fn mapped_fallback_for_large_maps() {
        // Way past the static buffer: forces the kernel mapping path.
        let counters = STATIC_BUFFER_WORDS * usize::BITS as usize;
        let mut map = PackedPageMap::new(2, counters, 1);

        assert!(map.is_allocated());
        assert!(map.buffer_size() > STATIC_BUFFER_WORDS * mem::size_of::<usize>());

        map.inc(0, 0);
        map.inc(1, counters - 1);
        assert_eq!(map.get(0, 0), 1);
        assert_eq!(map.get(1, counters - 1), 1);
    }

    #[test]
    fn concurrent_maps_do_not_collide() {
        // Whichever of the two gets the static buffer, the other one must
        // transparently use a mapping of its own.
        let mut first = PackedPageMap::new(1, 16, 3);
        let mut second = PackedPageMap::new(1, 16, 3);
        assert!(first.is_allocated());
        assert!(second.is_allocated());

        first.inc_n(0, 3, 2);
        second.inc(0, 3);
        assert_eq!(first.get(0, 3), 2);
        assert_eq!(second.get(0, 3), 1);

        // Dropping the maps must leave the static buffer reusable.
        drop(first);
        drop(second);
        let third = PackedPageMap::new(1, 16, 3);
        assert!(third.is_allocated());
        assert_eq!(third.get(0, 3), 0);
    }
}
