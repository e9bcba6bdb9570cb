//! Frame-skip selection over a driver's time-ordered samples.

/// Returns the indices to keep from a time-ordered sequence whose lap numbers
/// are `laps`. Keeps every index with `i % frame_skip == 0`, plus the first and
/// last sample of every lap run so lap boundaries survive downsampling.
pub(crate) fn retained_indices(laps: &[u32], frame_skip: u32) -> Vec<usize> {
    let n = laps.len();
    let stride = frame_skip.max(1) as usize;
    (0..n)
        .filter(|&i| {
            i % stride == 0
                || i == 0
                || i + 1 == n
                || laps[i] != laps[i - 1]
                || laps[i] != laps[i + 1]
        })
        .collect()
}
