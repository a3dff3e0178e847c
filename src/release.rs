use log::debug;

use crate::{context::ReleaseContext, freelist::TransferBatch, recorder::RangeRecorder};

/// Turns a linear stream of per-page "releasable or not" verdicts into
/// coalesced range emissions: consecutive releasable pages become one
/// range, anything else flushes the run. Page positions are tracked here
/// so the scan only has to answer the per-page question.
struct RangeTracker<'a, R: RangeRecorder> {
    recorder: &'a mut R,
    page_size_log: u32,
    in_range: bool,
    current_page: usize,
    range_start_page: usize,
}

impl<'a, R: RangeRecorder> RangeTracker<'a, R> {
    /// `first_page` anchors the emitted offsets: for partial release
    /// windows the first processed page sits `first_page` pages into the
    /// region, and emitted ranges are relative to the region base.
    fn new(recorder: &'a mut R, page_size_log: u32, first_page: usize) -> Self {
        Self {
            recorder,
            page_size_log,
            in_range: false,
            current_page: first_page,
            range_start_page: 0,
        }
    }

    fn process_next_page(&mut self, releasable: bool) {
        if releasable {
            if !self.in_range {
                self.range_start_page = self.current_page;
                self.in_range = true;
            }
        } else {
            self.close_opened_range();
        }

        self.current_page += 1;
    }

    /// Jumps over `n` pages that were never marked (skipped regions).
    /// Whatever run was open can't continue across them.
    fn skip_pages(&mut self, n: usize) {
        self.close_opened_range();
        self.current_page += n;
    }

    /// Region boundary: runs never coalesce across regions, every region
    /// gets release calls of its own.
    fn finish_region(&mut self) {
        self.close_opened_range();
    }

    fn finish(mut self) {
        self.close_opened_range();
    }

    fn close_opened_range(&mut self) {
        if self.in_range {
            self.recorder.release_page_range_to_os(
                self.range_start_page << self.page_size_log,
                self.current_page << self.page_size_log,
            );
            self.in_range = false;
        }
    }
}

/// Scans the populated page map of `context` and hands every page range
/// that holds only free blocks to `recorder`. Regions for which
/// `skip_region` returns true are passed over without reading their
/// counters (their allocator typically knows they're fully in use).
///
/// A page is releasable when its free block counter has reached the
/// number of blocks that overlap the page when nothing is allocated.
/// When the geometry gives every page the same such number, a single
/// comparison per page suffices. Otherwise the expected number is
/// recomputed per page by walking block boundaries alongside page
/// boundaries: each page gets the blocks wholly inside it, plus one for
/// a block straddling in from the left, plus one for a block straddling
/// out to the right.
///
/// Pages that pass the check are stamped as all counted, so a second
/// scan over the same context reaches the same verdicts.
pub fn release_free_memory_to_os<R, S>(
    context: &mut ReleaseContext,
    recorder: &mut R,
    mut skip_region: S,
) where
    R: RangeRecorder,
    S: FnMut(usize) -> bool,
{
    let page_size = context.page_size;
    let block_size = context.block_size;
    let pages_count = context.pages_count;
    let number_of_regions = context.number_of_regions;
    let release_page_offset = context.release_page_offset;
    let full_pages_block_count_max = context.full_pages_block_count_max;
    let same_block_count_per_page = context.same_block_count_per_page;
    let page_size_log = context.page_size_log;

    let Some(page_map) = context.page_map.as_mut() else {
        debug!("nothing marked, nothing to release");
        return;
    };

    let mut tracker = RangeTracker::new(recorder, page_size_log, release_page_offset);

    if same_block_count_per_page {
        // Fast path, every page expects the same count.
        for region in 0..number_of_regions {
            if skip_region(region) {
                tracker.skip_pages(pages_count);
                continue;
            }

            for page in 0..pages_count {
                let releasable = page_map.update_as_all_counted_if(
                    region,
                    page,
                    full_pages_block_count_max,
                );
                tracker.process_next_page(releasable);
            }

            tracker.finish_region();
        }
    } else {
        // Slow path, walk block boundaries along with page boundaries to
        // know how many blocks each page expects.
        let pn = if block_size < page_size {
            page_size / block_size
        } else {
            1
        };
        let pnc = pn * block_size;

        for region in 0..number_of_regions {
            if skip_region(region) {
                tracker.skip_pages(pages_count);
                continue;
            }

            let mut prev_page_boundary = 0;
            let mut current_boundary = 0;
            if release_page_offset > 0 {
                prev_page_boundary = release_page_offset * page_size;
                current_boundary = prev_page_boundary.next_multiple_of(block_size);
            }

            for page in 0..pages_count {
                let page_boundary = prev_page_boundary + page_size;

                // Blocks wholly inside the page...
                let mut blocks_per_page = pn;
                if current_boundary < page_boundary {
                    // ...plus one straddling in from the previous page...
                    if current_boundary > prev_page_boundary {
                        blocks_per_page += 1;
                    }

                    // ...plus one straddling out into the next page.
                    current_boundary += pnc;
                    if current_boundary < page_boundary {
                        blocks_per_page += 1;
                        current_boundary += block_size;
                    }
                }
                prev_page_boundary = page_boundary;

                let releasable =
                    page_map.update_as_all_counted_if(region, page, blocks_per_page);
                tracker.process_next_page(releasable);
            }

            tracker.finish_region();
        }
    }

    tracker.finish();
}

/// One-call variant for the common case: build the context over whole
/// regions, mark the free list, scan. Useful when the caller doesn't need
/// the page usage information afterwards.
pub fn release_free_blocks_to_os<'a, B, D, I, R, S>(
    free_list: I,
    region_size: usize,
    number_of_regions: usize,
    block_size: usize,
    recorder: &mut R,
    decompact: D,
    skip_region: S,
) where
    B: TransferBatch + 'a,
    D: Fn(B::Handle) -> usize,
    I: IntoIterator<Item = &'a B>,
    R: RangeRecorder,
    S: FnMut(usize) -> bool,
{
    let mut context = ReleaseContext::new(
        block_size,
        region_size,
        number_of_regions,
        region_size,
        0,
    );

    if !context.mark_free_blocks(free_list, decompact, recorder.base()) {
        return;
    }

    release_free_memory_to_os(&mut context, recorder, skip_region);
}
