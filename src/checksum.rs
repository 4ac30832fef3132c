//! Ones' complement checksum helpers.
//!
//! The translator rewrites IPv4 headers into IPv6 headers without touching
//! the transport payload, so the coordinator has to hand it a source address
//! whose contribution to the TCP/UDP pseudo-header checksum cancels out the
//! rewrite. These helpers compute that address.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Compute the ones' complement sum of 16-bit big-endian words in a slice.
#[inline]
pub fn ones_complement_sum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;

    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }

    // Odd trailing byte is padded with zero on the right
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }

    sum
}

/// Fold a 32-bit sum into a 16-bit ones' complement value.
#[inline]
pub fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Pick the final 16-bit word of a candidate IPv6 source address so that the
/// stateless v4-to-v6 rewrite is checksum neutral.
///
/// Translating a packet replaces the IPv4 source with `v6` and the IPv4
/// destination with the destination embedded into `pfx96`, so the
/// pseudo-header sum changes by `sum(v6) + sum(pfx96[..12]) - sum(v4)`.
/// Neutrality therefore requires
/// `sum(v6) + sum(pfx96[..12]) == sum(v4)  (mod 0xffff)`,
/// which the returned word, placed at `v6[14..16]`, establishes.
pub fn checksum_neutral_word(v6: &[u8; 16], v4: Ipv4Addr, pfx96: Ipv6Addr) -> u16 {
    let target = ones_complement_sum(&v4.octets());
    let fixed = ones_complement_sum(&v6[..14]) + ones_complement_sum(&pfx96.octets()[..12]);
    // Ones' complement subtraction: target - fixed
    fold_checksum(fold_checksum(target) as u32 + (!fold_checksum(fixed)) as u32)
}

/// Whether `v6` is a checksum-neutral source address for `v4` under `pfx96`.
pub fn is_checksum_neutral(v6: Ipv6Addr, v4: Ipv4Addr, pfx96: Ipv6Addr) -> bool {
    let lhs = fold_checksum(
        ones_complement_sum(&v6.octets()) + ones_complement_sum(&pfx96.octets()[..12]),
    );
    let rhs = fold_checksum(ones_complement_sum(&v4.octets()));
    // 0 and 0xffff are the same value in ones' complement arithmetic
    normalize(lhs) == normalize(rhs)
}

fn normalize(word: u16) -> u16 {
    if word == 0xFFFF { 0 } else { word }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_checksum() {
        assert_eq!(fold_checksum(0), 0);
        assert_eq!(fold_checksum(0x1_FFFF), 1);
        assert_eq!(fold_checksum(0x1_FFFE), 0xFFFF);
        assert_eq!(fold_checksum(0x2_0003), 5);
    }

    #[test]
    fn test_ones_complement_sum_odd_length() {
        assert_eq!(ones_complement_sum(&[0x12, 0x34, 0x56]), 0x1234 + 0x5600);
    }

    #[test]
    fn test_neutral_word_makes_address_neutral() {
        let v4 = Ipv4Addr::new(192, 0, 0, 4);
        let pfx96: Ipv6Addr = "64:ff9b::".parse().unwrap();
        let candidates: [Ipv6Addr; 3] = [
            "2001:db8:1:2:464:c000:4:0".parse().unwrap(),
            "fd00::1:2:3:0".parse().unwrap(),
            "2001:db8::".parse().unwrap(),
        ];

        for candidate in candidates {
            let mut octets = candidate.octets();
            let word = checksum_neutral_word(&octets, v4, pfx96);
            octets[14..16].copy_from_slice(&word.to_be_bytes());
            let v6 = Ipv6Addr::from(octets);
            assert!(
                is_checksum_neutral(v6, v4, pfx96),
                "{v6} is not checksum neutral for {v4} under {pfx96}"
            );
        }
    }

    #[test]
    fn test_neutral_word_varies_with_prefix() {
        let v4 = Ipv4Addr::new(192, 0, 0, 5);
        let base: Ipv6Addr = "2001:db8::".parse().unwrap();
        let octets = base.octets();

        let w1 = checksum_neutral_word(&octets, v4, "64:ff9b::".parse().unwrap());
        let w2 = checksum_neutral_word(&octets, v4, "2001:db8:a::".parse().unwrap());
        assert_ne!(w1, w2);
    }
}
