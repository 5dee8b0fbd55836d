//! Squared-Euclidean distance over quantized event vectors.

/// Columns accumulated between early-exit checks.
const CHECKPOINT: usize = 16;

/// Squared Euclidean distance between two event vectors, abandoned early
/// once it can no longer land under `cap`.
///
/// After every 16 accumulated columns the partial sum is compared against
/// `cap`; if it is already larger the partial sum is returned as-is. The
/// caller may therefore only rely on the result when it is `<= cap`.
///
/// The accumulator is 64-bit: 64 columns of values below 16384 can sum to
/// roughly `6.9e10`, past what 32 bits hold.
#[inline]
pub fn squared_distance_capped(a: &[u16], b: &[u16], cap: u64) -> u64 {
    debug_assert_eq!(a.len(), b.len());
    let mut total = 0u64;
    for (ca, cb) in a.chunks(CHECKPOINT).zip(b.chunks(CHECKPOINT)) {
        for (&x, &y) in ca.iter().zip(cb.iter()) {
            let diff = i64::from(x) - i64::from(y);
            total += (diff * diff) as u64;
        }
        if total > cap {
            return total;
        }
    }
    total
}

/// Exact squared Euclidean distance, no early exit.
#[inline]
pub fn squared_distance(a: &[u16], b: &[u16]) -> u64 {
    squared_distance_capped(a, b, u64::MAX)
}
