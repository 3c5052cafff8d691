//! Randomly generated identifiers.
//!
//! Message and channel ids only need uniqueness per sender, so 16 bytes of
//! OS entropy rendered as hex is plenty.

/// Fill an `N`-byte array from the OS entropy source.
///
/// Panics if the OS entropy source fails, which indicates a broken system
/// that cannot safely run a payment node anyway.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).expect("OS entropy source failed");
    buf
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arrays_are_distinct() {
        // Sixteen bytes of entropy colliding across two draws means the OS
        // rng is broken; treat that as a test failure.
        let a = random_array::<16>();
        let b = random_array::<16>();
        assert_ne!(a, b);
    }
}
