//! Pure functions behind the result readers.
//!
//! Head clamping, entry bounds and counter saturation are kept here as
//! value-in/value-out functions with no access to shared memory, so the
//! arithmetic can be tested on its own and the readers stay thin.

/// Clamp the kernel-reported trace head to the buffer capacity.
///
/// The kernel keeps bumping the head after the buffer is full; anything
/// past `capacity` is a count of dropped entries, not valid slots.
///
/// # Examples
///
/// ```
/// use ksancov::verified::clamp_head;
///
/// assert_eq!(clamp_head(3, 10), 3);
/// assert_eq!(clamp_head(12, 10), 10);
/// ```
pub fn clamp_head(head: usize, capacity: usize) -> usize {
    let clamped = head.min(capacity);

    // Tiger Style: Positive assertion - never past capacity
    debug_assert!(clamped <= capacity);

    // Tiger Style: Negative assertion - never invents entries
    debug_assert!(clamped <= head);

    clamped
}

/// Number of entries the kernel could not store because the buffer was full.
pub fn dropped_entries(head: usize, capacity: usize) -> usize {
    head.saturating_sub(capacity)
}

/// Whether slot `index` holds a recorded entry given a clamped head.
pub fn entry_readable(index: usize, clamped_head: usize) -> bool {
    index < clamped_head
}

/// Increment an 8-bit hit counter without wrapping.
pub fn saturating_hit(count: u8) -> u8 {
    count.saturating_add(1)
}

/// AFL-style edge index for a transition from `prev` to `cur`.
///
/// Returns the bitmap index and the `prev` value to carry into the next
/// step (`cur >> 1`, so that A→B and B→A land in different slots).
///
/// ```
/// use ksancov::verified::afl_edge;
///
/// let (index, next) = afl_edge(0, 0x1234, 65536);
/// assert_eq!(index, 0x1234);
/// assert_eq!(next, 0x91a);
/// ```
pub fn afl_edge(prev: u64, cur: u64, map_size: usize) -> (usize, u64) {
    debug_assert!(map_size > 0);
    let index = ((prev ^ cur) % map_size as u64) as usize;
    (index, cur >> 1)
}
