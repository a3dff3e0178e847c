use log::debug;

use crate::{
    freelist::TransferBatch,
    page_map::PackedPageMap,
    platform,
    round::{round_down, round_up},
};

/// How many free blocks can possibly overlap one page, and whether that
/// number is the same for every page. Blocks and pages rarely agree on
/// their boundaries, so this depends on how the two sizes divide:
///
/// ```text
/// blocks divide the page        pages see 2 blocks each, always
///
/// +-----+-----+-----+-----+     +-------+-------+--
/// |     |     |     |     |     |       |       |       ...
/// +-----+-----+-----+-----+     +---+---+---+---+--
/// |-       one page       -|    |- page -||- page -|
///
/// boundaries drift              pages see 2 or 3 blocks
///
/// +------+------+------+------+------+
/// |      |      |      |      |      |
/// +------+------+------+------+------+
/// |-  page  -||-  page  -||-  page  -|
///     (2)         (3)         (2)
/// ```
///
/// Returns `(max_blocks_per_page, same_count_for_every_page)`.
fn classify_geometry(block_size: usize, page_size: usize) -> (usize, bool) {
    if block_size <= page_size {
        if page_size % block_size == 0 {
            // Blocks tile the page exactly, no cross overs.
            (page_size / block_size, true)
        } else if block_size % (page_size % block_size) == 0 {
            // Blocks cross page boundaries, but the drift per page divides
            // the block size, so every page still sees the same count.
            (page_size / block_size + 1, true)
        } else {
            // Blocks cross page boundaries and the drift never repeats the
            // same way, a page sees one or two partial blocks.
            (page_size / block_size + 2, false)
        }
    } else if block_size % page_size == 0 {
        // One block covers multiple whole pages.
        (1, true)
    } else {
        // One block covers multiple pages and straddles, some pages see
        // one block, some see two.
        (2, false)
    }
}

/// Precomputed geometry and scratch state for one release pass over the
/// regions of a single size class.
///
/// The caller builds a context, feeds it the current free state through
/// [`ReleaseContext::mark_free_blocks`] and/or
/// [`ReleaseContext::mark_range_as_all_counted`], and then runs
/// [`crate::release_free_memory_to_os`] to turn the accumulated page
/// counters into advisory release calls. The context is meant to live on
/// the stack for exactly that sequence; its page map is allocated on the
/// first marker call and returned when the context drops.
///
/// `number_of_regions` regions of `region_size` bytes each are assumed to
/// sit back to back at some base address, every region carved into
/// `block_size` blocks starting at its offset 0. When there is a single
/// region, a sub-window of it can be processed instead of the whole thing:
/// `release_size` bytes starting `release_offset` bytes into the region
/// (both page aligned). Multiple regions always release fully, so
/// `release_size == region_size` and `release_offset == 0` there.
pub struct ReleaseContext {
    pub(crate) block_size: usize,
    pub(crate) region_size: usize,
    pub(crate) number_of_regions: usize,
    /// First page of the release window; pages before it are not counted.
    pub(crate) release_page_offset: usize,
    pub(crate) page_size: usize,
    pub(crate) pages_count: usize,
    pub(crate) page_size_log: u32,
    pub(crate) rounded_region_size: usize,
    pub(crate) rounded_size: usize,
    pub(crate) full_pages_block_count_max: usize,
    pub(crate) same_block_count_per_page: bool,
    pub(crate) page_map: Option<PackedPageMap>,
}

impl ReleaseContext {
    /// Computes the geometry for a release pass. See the struct docs for
    /// what the parameters mean.
    pub fn new(
        block_size: usize,
        region_size: usize,
        number_of_regions: usize,
        release_size: usize,
        release_offset: usize,
    ) -> Self {
        debug_assert!(block_size > 0);
        debug_assert!(region_size >= block_size);
        debug_assert!(number_of_regions > 0);

        let page_size = platform::page_size();
        let page_size_log = page_size.trailing_zeros();

        let (full_pages_block_count_max, same_block_count_per_page) =
            classify_geometry(block_size, page_size);

        // Partial windows over one region out of many would need to know
        // which region the window cuts through and how its last block
        // interacts with the cut. Nothing needs that, so it's simply not
        // supported.
        if number_of_regions != 1 {
            debug_assert_eq!(release_size, region_size);
            debug_assert_eq!(release_offset, 0);
        }
        debug_assert_eq!(release_offset % page_size, 0);

        let rounded_region_size = round_up(region_size, page_size);

        Self {
            block_size,
            region_size,
            number_of_regions,
            release_page_offset: release_offset >> page_size_log,
            page_size,
            pages_count: release_size.div_ceil(page_size),
            page_size_log,
            rounded_region_size,
            rounded_size: number_of_regions * rounded_region_size,
            full_pages_block_count_max,
            same_block_count_per_page,
            page_map: None,
        }
    }

    /// Number of pages in the release window of each region.
    pub fn pages_count(&self) -> usize {
        self.pages_count
    }

    /// Maximum number of free blocks that can overlap one page for this
    /// geometry.
    pub fn full_pages_block_count_max(&self) -> usize {
        self.full_pages_block_count_max
    }

    /// Whether every page sees the same maximum block count. Decides
    /// between the fast and the slow scan in
    /// [`crate::release_free_memory_to_os`].
    pub fn same_block_count_per_page(&self) -> bool {
        self.same_block_count_per_page
    }

    /// Whether any marker call has populated the page map yet. The scan is
    /// a no-op until this is true.
    pub fn has_block_marked(&self) -> bool {
        self.page_map.is_some()
    }

    /// Maps a region-local byte offset to a page index within the release
    /// window. Page index 0 is the page at `release_offset`.
    pub fn page_index_of(&self, offset_in_region: usize) -> usize {
        (offset_in_region >> self.page_size_log) - self.release_page_offset
    }

    /// The page map is only needed once some marker runs, and sizing it
    /// requires the geometry above, so it's allocated on first use. Returns
    /// false if no storage could be obtained, in which case the pass is
    /// over before it began: nothing gets marked and nothing gets
    /// released. The memory simply stays with the process for now.
    fn ensure_page_map_allocated(&mut self) -> bool {
        if self.page_map.is_none() {
            let map = PackedPageMap::new(
                self.number_of_regions,
                self.pages_count,
                self.full_pages_block_count_max,
            );

            if !map.is_allocated() {
                debug!("no memory for a page map, skipping this release pass");
                return false;
            }

            self.page_map = Some(map);
        }

        true
    }

    /// Marks the address range `[from, to)` as holding only free blocks.
    /// `base` is the address of region 0; `from` must be page aligned and
    /// `to` must be page aligned or equal to the region end. The whole
    /// range must lie within one region.
    ///
    /// Pages fully inside the range are certainly free, so they're stamped
    /// as all counted wholesale instead of visiting their blocks one by
    /// one. The ends need more care: a block can straddle `from` or `to`,
    /// and whether *its* page is releasable depends on blocks outside this
    /// range, which only the free list marker knows about. So the pages
    /// touched by straddling blocks get plain counter increments, and the
    /// final verdict on them falls out of the combined counts.
    ///
    /// ```text
    ///          from                          to
    ///            v                           v
    ///            +---------------------------+
    ///       +-----+-----+-----+-----+-----+-----+
    ///       |     |     |     |     |     |     |
    ///       +-----+-----+-----+-----+-----+-----+
    ///       |- first page -||- ... all  -||- last -|
    ///          (counted)      (stamped)    (counted)
    /// ```
    ///
    /// Returns false if the page map could not be allocated; nothing is
    /// marked in that case.
    pub fn mark_range_as_all_counted(&mut self, from: usize, to: usize, base: usize) -> bool {
        debug_assert!(from < to);

        if !self.ensure_page_map_allocated() {
            return false;
        }

        let block_size = self.block_size;
        let page_size = self.page_size;
        let region_size = self.region_size;
        let number_of_regions = self.number_of_regions;
        let page_size_log = self.page_size_log;
        let release_page_offset = self.release_page_offset;
        let page_index = |p: usize| (p >> page_size_log) - release_page_offset;

        // SAFETY: `ensure_page_map_allocated` just succeeded.
        let page_map = unsafe { self.page_map.as_mut().unwrap_unchecked() };

        let from_offset = from - base;
        let to_offset = to - base;
        debug_assert_eq!(from_offset % page_size, 0);

        let region_index = if number_of_regions == 1 {
            0
        } else {
            from_offset / region_size
        };
        debug_assert_eq!(
            region_index,
            if number_of_regions == 1 {
                0
            } else {
                (to_offset - 1) / region_size
            }
        );

        let mut from_in_region = from_offset - region_index * region_size;
        let mut to_in_region = to_offset - region_index * region_size;

        // First block that starts inside the range. If even that one sits
        // past the end, a single block straddles the entire range and
        // nothing here is known to be free on its own.
        let first_block_in_range = from_in_region.next_multiple_of(block_size);
        if first_block_in_range >= to_in_region {
            return true;
        }

        // That block may not start on the first page of the range, move
        // `from_in_region` back to the page it starts on.
        from_in_region = round_down(first_block_in_range, page_size);

        // A block straddling `from` means the first page can't just be
        // stamped: count the blocks that start on it and move on to the
        // next page boundary.
        if first_block_in_range != from_in_region {
            debug_assert!(from_in_region + page_size > first_block_in_range);
            let blocks_in_first_page =
                (from_in_region + page_size - first_block_in_range).div_ceil(block_size);
            page_map.inc_n(region_index, page_index(from_in_region), blocks_in_first_page);
            from_in_region = round_up(from_in_region + 1, page_size);
        }

        // Last block that starts inside the range.
        let last_block_in_range = (to_in_region - 1) / block_size * block_size;
        if last_block_in_range < from_in_region {
            return true;
        }

        if last_block_in_range + block_size != region_size {
            debug_assert_eq!(to_in_region % page_size, 0);

            // The last block runs past `to`, so the pages it covers from
            // `to` onwards only get their counters bumped.
            if last_block_in_range + block_size != to_in_region {
                page_map.inc_range(
                    region_index,
                    page_index(to_in_region),
                    page_index(last_block_in_range + block_size - 1),
                );
            }
        } else {
            // The last block is the last one of the whole region. The
            // sliver behind it (if any) is never allocatable, so the range
            // effectively extends to the region end.
            to_in_region = region_size;
        }

        // Everything between the handled ends is free for sure.
        if from_in_region < to_in_region {
            page_map.set_as_all_counted_range(
                region_index,
                page_index(from_in_region),
                page_index(to_in_region - 1),
            );
        }

        true
    }

    /// Walks a free list snapshot and counts, for every page, how many free
    /// blocks overlap it. `free_list` iterates batches of compacted block
    /// handles, `decompact` turns a handle into an absolute address, and
    /// `base` is the address of region 0. Handles outside the regions are
    /// ignored.
    ///
    /// When the last whole block of a region is free, the slack between its
    /// end and the rounded region end is credited too: that sliver can
    /// never be allocated, so it must not keep the last pages pinned.
    ///
    /// Returns false if the page map could not be allocated; nothing is
    /// marked in that case.
    pub fn mark_free_blocks<'a, B, D, I>(&mut self, free_list: I, decompact: D, base: usize) -> bool
    where
        B: TransferBatch + 'a,
        D: Fn(B::Handle) -> usize,
        I: IntoIterator<Item = &'a B>,
    {
        if !self.ensure_page_map_allocated() {
            return false;
        }

        let block_size = self.block_size;
        let page_size = self.page_size;
        let region_size = self.region_size;
        let number_of_regions = self.number_of_regions;
        let rounded_size = self.rounded_size;
        let rounded_region_size = self.rounded_region_size;
        let page_size_log = self.page_size_log;
        let release_page_offset = self.release_page_offset;
        let page_index = |p: usize| (p >> page_size_log) - release_page_offset;

        // SAFETY: `ensure_page_map_allocated` just succeeded.
        let page_map = unsafe { self.page_map.as_mut().unwrap_unchecked() };

        let last_block_in_region = (region_size / block_size - 1) * block_size;

        // The region's trailing sliver shares pages with the last whole
        // block. Pretend the sliver is tiled with more blocks and count
        // them as free, but only when the real last block is.
        let mark_last_block = |page_map: &mut PackedPageMap, region_index: usize| {
            let mut p_in_region = last_block_in_region + block_size;
            while p_in_region < rounded_region_size {
                page_map.inc_range(
                    region_index,
                    page_index(p_in_region),
                    page_index(p_in_region + block_size - 1),
                );
                p_in_region += block_size;
            }
        };

        if block_size <= page_size && page_size % block_size == 0 {
            // Every block touches exactly one page.
            for batch in free_list {
                for i in 0..batch.count() {
                    let p = decompact(batch.get(i)).wrapping_sub(base);
                    if p >= rounded_size {
                        continue;
                    }

                    let region_index = if number_of_regions == 1 {
                        0
                    } else {
                        p / region_size
                    };
                    let p_in_region = p - region_index * region_size;

                    page_map.inc(region_index, page_index(p_in_region));
                    if p_in_region == last_block_in_region {
                        mark_last_block(&mut *page_map, region_index);
                    }
                }
            }
        } else {
            // Blocks may touch several pages.
            for batch in free_list {
                for i in 0..batch.count() {
                    let p = decompact(batch.get(i)).wrapping_sub(base);
                    if p >= rounded_size {
                        continue;
                    }

                    let region_index = if number_of_regions == 1 {
                        0
                    } else {
                        p / region_size
                    };
                    let p_in_region = p - region_index * region_size;

                    page_map.inc_range(
                        region_index,
                        page_index(p_in_region),
                        page_index(p_in_region + block_size - 1),
                    );
                    if p_in_region == last_block_in_region {
                        mark_last_block(&mut *page_map, region_index);
                    }
                }
            }
        }

        true
    }

    /// Only used for inspecting marker results in tests.
    #[cfg(test)]
    pub(crate) fn page_map(&self) -> Option<&PackedPageMap> {
        self.page_map.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Number of blocks overlapping `page` when blocks of `block_size`
    /// bytes are laid out from offset 0 without end: everything from the
    /// block containing the page's first byte through the block containing
    /// its last.
    fn blocks_overlapping_page(block_size: usize, page_size: usize, page: usize) -> usize {
        let start = page * page_size;
        let end = start + page_size;

        (end - 1) / block_size - start / block_size + 1
    }

    #[test]
    fn geometry_table() {
        // Blocks tile the page.
        assert_eq!(classify_geometry(1024, 4096), (4, true));
        assert_eq!(classify_geometry(4096, 4096), (1, true));

        // Blocks straddle but drift evenly: 4096 % 3072 = 1024 divides
        // 3072, every page sees two blocks.
        assert_eq!(classify_geometry(3072, 4096), (2, true));

        // Blocks straddle unevenly: 4096 % 3000 = 1096 doesn't divide
        // 3000, pages see two or three blocks.
        assert_eq!(classify_geometry(3000, 4096), (3, false));

        // One block covers whole pages.
        assert_eq!(classify_geometry(16384, 4096), (1, true));

        // One block covers pages and straddles.
        assert_eq!(classify_geometry(6144, 4096), (2, false));
    }

    proptest! {
        #[test]
        fn classification_bounds_true_block_counts(
            page_size_log in 4u32..=20,
            block_size in 1usize..=(1 << 20),
        ) {
            let page_size = 1usize << page_size_log;
            let (max, same) = classify_geometry(block_size, page_size);

            // Sample enough pages to see the drift pattern move.
            let counts: Vec<usize> = (0..64)
                .map(|page| blocks_overlapping_page(block_size, page_size, page))
                .collect();

            for &count in &counts {
                prop_assert!(count <= max);
            }

            if same {
                for &count in &counts {
                    prop_assert_eq!(count, max);
                }
            }
        }
    }

    #[test]
    fn geometry_accessors_match_classification() {
        let page_size = platform::page_size();
        let block_size = page_size / 2;
        let context = ReleaseContext::new(block_size, 8 * page_size, 1, 8 * page_size, 0);

        // The context exposes exactly what the classifier decided.
        let (max, same) = classify_geometry(block_size, page_size);
        assert_eq!(context.full_pages_block_count_max(), max);
        assert_eq!(context.same_block_count_per_page(), same);

        // Two blocks tile each page, and every page looks the same.
        assert_eq!(context.full_pages_block_count_max(), 2);
        assert!(context.same_block_count_per_page());
    }

    #[test]
    fn marking_populates_the_page_map_lazily() {
        let page_size = platform::page_size();
        let mut context = ReleaseContext::new(page_size, 4 * page_size, 1, 4 * page_size, 0);

        // Nothing marked yet: a caller checking here can skip the whole
        // scan, there is no page map to read.
        assert!(!context.has_block_marked());

        assert!(context.mark_range_as_all_counted(0, page_size, 0));
        assert!(context.has_block_marked());
    }

    #[test]
    fn page_index_respects_release_window() {
        let page_size = platform::page_size();
        let context = ReleaseContext::new(
            page_size,
            16 * page_size,
            1,
            8 * page_size,
            4 * page_size,
        );

        // The window starts 4 pages in, so that offset is page 0.
        assert_eq!(context.page_index_of(4 * page_size), 0);
        assert_eq!(context.page_index_of(5 * page_size), 1);
        assert_eq!(context.page_index_of(11 * page_size), 7);
        assert_eq!(context.pages_count(), 8);
    }

    #[test]
    fn mark_range_stamps_whole_pages() {
        let page_size = platform::page_size();

        // Block == page, 8 page region, mark pages 2..6.
        let mut context = ReleaseContext::new(
            page_size,
            8 * page_size,
            1,
            8 * page_size,
            0,
        );

        assert!(context.mark_range_as_all_counted(2 * page_size, 6 * page_size, 0));
        let map = context.page_map().unwrap();

        assert_eq!(map.get(0, 1), 0);
        for page in 2..6 {
            assert!(map.is_all_counted(0, page));
        }
        assert_eq!(map.get(0, 6), 0);
    }

    #[test]
    fn mark_range_counts_straddling_ends() {
        let page_size = platform::page_size();
        let block_size = 3 * page_size / 4;

        // Region of four such blocks is exactly 3 pages. Mark [1 page,
        // 3 pages): the block at 3/4 page straddles `from`.
        let mut context = ReleaseContext::new(
            block_size,
            3 * page_size,
            1,
            3 * page_size,
            0,
        );

        assert!(context.mark_range_as_all_counted(page_size, 3 * page_size, 0));
        let map = context.page_map().unwrap();

        // Page 0 is outside the range.
        assert_eq!(map.get(0, 0), 0);

        // Page 1 holds the start of one block inside the range (the one at
        // 6/4 page), counted not stamped, because the block at 3/4 page
        // straddling `from` also lives there and this range knows nothing
        // about it.
        assert_eq!(map.get(0, 1), 1);

        // Page 2 is covered by the range up to the region end.
        assert!(map.is_all_counted(0, 2));
    }

    #[test]
    fn mark_range_swallowed_by_straddling_block() {
        let page_size = platform::page_size();
        let block_size = 4 * page_size;

        // One giant block covers the whole marked window: the range alone
        // proves nothing, no page may be counted.
        let mut context = ReleaseContext::new(
            block_size,
            8 * page_size,
            1,
            8 * page_size,
            0,
        );

        assert!(context.mark_range_as_all_counted(page_size, 3 * page_size, 0));
        let map = context.page_map().unwrap();
        for page in 0..8 {
            assert_eq!(map.get(0, page), 0);
        }
    }

    #[test]
    fn mark_free_blocks_counts_overlaps() {
        let page_size = platform::page_size();
        let block_size = 3 * page_size / 4;
        struct Batch(Vec<usize>);

        impl TransferBatch for Batch {
            type Handle = usize;

            fn count(&self) -> u16 {
                self.0.len() as u16
            }

            fn get(&self, i: u16) -> usize {
                self.0[i as usize]
            }
        }

        // Four blocks tile the 3 page region exactly. Free the two middle
        // ones.
        let mut context = ReleaseContext::new(
            block_size,
            3 * page_size,
            1,
            3 * page_size,
            0,
        );

        let batch = Batch(vec![block_size, 2 * block_size]);
        assert!(context.mark_free_blocks([&batch], |handle| handle, 0));
        let map = context.page_map().unwrap();

        // Block 1 covers pages 0 and 1, block 2 covers pages 1 and 2.
        assert_eq!(map.get(0, 0), 1);
        assert_eq!(map.get(0, 1), 2);
        assert_eq!(map.get(0, 2), 1);
    }
}
