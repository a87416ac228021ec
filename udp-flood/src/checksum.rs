//! RFC 1071 Internet checksum.

/// Accumulate 16-bit big-endian words of `bytes` into `sum`.
///
/// A trailing odd byte is added as the high half of a zero-padded word.
#[inline]
pub fn accumulate(mut sum: u32, bytes: &[u8]) -> u32 {
    let mut words = bytes.chunks_exact(2);
    for word in words.by_ref() {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add(u16::from_be_bytes([*last, 0]) as u32);
    }
    sum
}

/// Fold carries into the low 16 bits (twice, enough for any 32-bit sum).
#[inline]
pub fn fold(sum: u32) -> u16 {
    let sum = (sum >> 16) + (sum & 0xffff);
    let sum = (sum >> 16) + (sum & 0xffff);
    sum as u16
}

/// One's-complement Internet checksum of `bytes`.
///
/// Store the result with `to_be_bytes()`; a buffer that already contains its
/// own checksum sums to `0xffff` and checksums to zero.
#[inline]
pub fn checksum(bytes: &[u8]) -> u16 {
    !fold(accumulate(0, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rfc1071_example() {
        // Worked example from RFC 1071 section 3.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(fold(accumulate(0, &data)), 0xddf2);
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn test_known_ipv4_header() {
        // Classic header from the Wikipedia IPv4 checksum example.
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let sum = checksum(&header);
        assert_eq!(sum, 0xb861);

        header[10..12].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(checksum(&header), 0);
    }

    #[test]
    fn test_odd_length_pads_high_byte() {
        assert_eq!(accumulate(0, &[0xab]), 0xab00);
        assert_eq!(accumulate(0, &[0x12, 0x34, 0xab]), 0x1234 + 0xab00);
    }

    #[test]
    fn test_empty_buffer() {
        assert_eq!(checksum(&[]), 0xffff);
    }

    #[test]
    fn test_fold_handles_double_carry() {
        // 0xffff + 0xffff = 0x1fffe -> 0xffff after folding.
        assert_eq!(fold(0x1fffe), 0xffff);
        assert_eq!(fold(0xffff_ffff), 0xffff);
    }

    proptest! {
        /// Writing the checksum into a zeroed field makes the buffer self-validate.
        #[test]
        fn test_checksum_self_validates(
            mut words in proptest::collection::vec(any::<u8>(), 2..512usize),
            field in any::<prop::sample::Index>(),
        ) {
            if words.len() % 2 == 1 {
                words.pop();
            }
            let slot = field.index(words.len() / 2) * 2;
            words[slot] = 0;
            words[slot + 1] = 0;

            let sum = checksum(&words);
            words[slot..slot + 2].copy_from_slice(&sum.to_be_bytes());

            prop_assert_eq!(fold(accumulate(0, &words)), 0xffff);
            prop_assert_eq!(checksum(&words), 0);
        }
    }
}
