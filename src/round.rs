/// Rounds `value` up to the next multiple of `boundary`. `boundary` must be
/// a power of two, which lets us use masking instead of division. For
/// arbitrary boundaries (block sizes are rarely powers of two) use
/// [`usize::next_multiple_of`] instead.
#[inline]
pub(crate) fn round_up(value: usize, boundary: usize) -> usize {
    debug_assert!(boundary.is_power_of_two());
    (value + boundary - 1) & !(boundary - 1)
}

/// Rounds `value` down to the previous multiple of `boundary`, which must be
/// a power of two. See [`round_up`].
#[inline]
pub(crate) fn round_down(value: usize, boundary: usize) -> usize {
    debug_assert!(boundary.is_power_of_two());
    value & !(boundary - 1)
}
