//! Small-tier size classes.
//!
//! 64 classes spanning 8 B to 1 MiB: the first 32 step linearly by 8 bytes
//! (8..=256), the rest follow a geometric-with-adjustment schedule that
//! terminates exactly at 1 MiB. The table is a compile-time constant;
//! selection is a binary search.

/// Number of small size classes.
pub(crate) const BUCKET_COUNT: usize = 64;

/// Payload capacity of each class, ascending.
pub(crate) const BUCKET_SIZES: [usize; BUCKET_COUNT] = [
    8, 16, 24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128, 136, 144, 152, 160, 168,
    176, 184, 192, 200, 208, 216, 224, 232, 240, 248, 256, 336, 432, 560, 728, 944, 1224, 1584,
    2048, 2656, 3448, 4472, 5800, 7520, 9744, 12640, 16384, 21248, 27560, 35736, 46344, 60104,
    77936, 101072, 131072, 169984, 220440, 285872, 370728, 480776, 623488, 808568, 1048576,
];

/// Index of the smallest class whose capacity holds `bytes`.
///
/// `bytes` must not exceed the largest class (the router guarantees this).
pub(crate) fn bucket_index(bytes: usize) -> usize {
    debug_assert!(bytes <= BUCKET_SIZES[BUCKET_COUNT - 1]);
    let mut low = 0;
    let mut high = BUCKET_COUNT - 1;
    while low < high {
        let middle = (low + high) >> 1;
        if bytes <= BUCKET_SIZES[middle] {
            high = middle;
        } else {
            low = middle + 1;
        }
    }
    low
}
