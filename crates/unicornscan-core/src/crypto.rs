//! Probe-correlation primitives
//!
//! Two building blocks let the sender forget every probe the moment it leaves
//! the NIC:
//!
//! - **SYN cookies**: a keyed SipHash-2-4 over the probe's address/port tuple,
//!   truncated to 32 bits and written into the TCP initial sequence number.
//!   The listener recomputes the cookie from the response headers and compares
//!   it against `ack - 1`; a match proves the response answers a probe this
//!   scan actually sent, with no connection table anywhere.
//! - **Blackrock shuffling**: a Feistel cipher producing a bijective mapping
//!   over `[0, range)`, so target and port iteration can walk a linearly
//!   incrementing index while emitting a randomized-looking sequence with full
//!   coverage and no bookkeeping.
//!
//! The cookie does not need adversarial unforgeability, only per-tuple
//! distinctness under a fixed per-scan key; SipHash gives that with one hash
//! per sent probe and one per received response.

use std::net::Ipv4Addr;
use std::num::Wrapping;

/// Compute the 32-bit SYN cookie for an outbound probe.
///
/// The same function authenticates responses: for a SYN-ACK from
/// `(remote, rport)` to `(local, lport)`, the listener calls
/// `syn_cookie(local, remote, lport, rport, key)` — i.e. with the tuple
/// oriented the way the original SYN was sent — and compares against the
/// received acknowledgment number minus one.
///
/// # Examples
///
/// ```
/// use std::net::Ipv4Addr;
/// use unicornscan_core::crypto::syn_cookie;
///
/// let isn = syn_cookie(
///     Ipv4Addr::new(10, 0, 0, 1),
///     Ipv4Addr::new(10, 0, 0, 2),
///     49152,
///     80,
///     0xdeadbeef,
/// );
/// // Deterministic for a fixed tuple and key.
/// assert_eq!(isn, syn_cookie("10.0.0.1".parse().unwrap(),
///     "10.0.0.2".parse().unwrap(), 49152, 80, 0xdeadbeef));
/// ```
pub fn syn_cookie(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, key: u32) -> u32 {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&src.octets());
    buf[4..8].copy_from_slice(&dst.octets());
    buf[8..10].copy_from_slice(&sport.to_be_bytes());
    buf[10..12].copy_from_slice(&dport.to_be_bytes());

    let k = expand_key(key);
    (siphash24(&buf, &k) & 0xffff_ffff) as u32
}

/// Check a received SYN-ACK (or RST-ACK) against the cookie we embedded.
///
/// `ack` is the raw acknowledgment number from the response; the probe's ISN
/// was `ack - 1` if the peer is answering our SYN. The tuple arguments are
/// oriented as the *original probe* was sent: `src`/`sport` are ours,
/// `dst`/`dport` are the scanned host's.
pub fn verify_cookie(
    ack: u32,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    key: u32,
) -> bool {
    syn_cookie(src, dst, sport, dport, key) == ack.wrapping_sub(1)
}

/// Expand the 32-bit per-scan key into a 128-bit SipHash key.
///
/// The expansion only needs to be deterministic and to spread the key bits;
/// both halves mix the scan key with fixed odd constants.
fn expand_key(key: u32) -> [u64; 2] {
    let k = key as u64;
    [
        (k | (k << 32)).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        (!k | (k << 32)).wrapping_mul(0xC2B2_AE3D_27D4_EB4F),
    ]
}

/// Blackrock shuffling structure for bijective mapping
///
/// Implements a Feistel cipher that shuffles numbers in range `[0, range)`.
/// This enables stateless randomized scanning: the sender walks index
/// 0,1,2,... and emits probes to `shuffle(index)`, covering every element of
/// the range exactly once in a scrambled order, with nothing stored.
///
/// Values that fall outside the range after encryption are cycle-walked back
/// through the cipher, which preserves bijectivity for non-power-of-two
/// ranges.
#[derive(Debug, Clone)]
pub struct BlackRock {
    /// Size of the range to shuffle (e.g. 256 for a /24)
    range: u64,

    /// Mask for extracting the left half
    a_mask: u64,

    /// Number of bits in the right half
    b_bits: u32,

    /// Mask for extracting the right half
    b_mask: u64,

    /// Seed for the shuffle
    seed: u64,

    /// Number of Feistel rounds
    rounds: u32,
}

impl BlackRock {
    /// Create a new shuffler over `[0, range)`.
    ///
    /// # Panics
    ///
    /// Panics if `range` is 0.
    pub fn new(range: u64, seed: u64, rounds: u32) -> Self {
        assert!(range > 0, "Range must be greater than 0");

        let total_bits = 64 - range.leading_zeros();
        let a_bits = total_bits / 2;
        let b_bits = total_bits - a_bits;

        let a_mask = if a_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << a_bits) - 1
        };
        let b_mask = if b_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << b_bits) - 1
        };

        Self {
            range,
            a_mask,
            b_bits,
            b_mask,
            seed,
            rounds,
        }
    }

    /// Map `index` in `[0, range)` to a distinct value in the same range.
    pub fn shuffle(&self, index: u64) -> u64 {
        debug_assert!(index < self.range);
        if index >= self.range {
            return index % self.range;
        }

        // Cycle-walk until the ciphertext lands back inside the range.
        let mut result = index;
        let mut iterations = 0u32;
        const MAX_ITERATIONS: u32 = 10;

        loop {
            result = self.feistel_encrypt(result);
            if result < self.range {
                return result;
            }
            iterations += 1;
            if iterations >= MAX_ITERATIONS {
                return result % self.range;
            }
        }
    }

    fn feistel_encrypt(&self, mut value: u64) -> u64 {
        for round in 0..self.rounds {
            let a = (value >> self.b_bits) & self.a_mask;
            let b = value & self.b_mask;

            let round_key = self.seed.wrapping_add(round as u64);
            let f_output = self.round_function(b, round_key);

            let new_a = b;
            let new_b = (a ^ f_output) & self.a_mask;

            value = (new_a << self.b_bits) | new_b;
        }
        value
    }

    /// Feistel round function: a fast multiply/xor-shift avalanche,
    /// masked to the left-half width.
    fn round_function(&self, value: u64, key: u64) -> u64 {
        let mut x = value.wrapping_mul(0x9E3779B97F4A7C15);
        x = x.wrapping_add(key);

        x ^= x >> 30;
        x = x.wrapping_mul(0xBF58476D1CE4E5B9);
        x ^= x >> 27;
        x = x.wrapping_mul(0x94D049BB133111EB);
        x ^= x >> 31;

        x & self.a_mask
    }
}

/// SipHash-2-4: 2 compression rounds, 4 finalization rounds.
///
/// Optimized for short inputs; the cookie path hashes exactly 12 bytes.
///
/// # Arguments
///
/// * `data` - input bytes
/// * `key` - 128-bit key as two u64 values `[k0, k1]`
pub fn siphash24(data: &[u8], key: &[u64; 2]) -> u64 {
    let mut v0 = Wrapping(key[0] ^ 0x736f6d6570736575);
    let mut v1 = Wrapping(key[1] ^ 0x646f72616e646f6d);
    let mut v2 = Wrapping(key[0] ^ 0x6c7967656e657261);
    let mut v3 = Wrapping(key[1] ^ 0x7465646279746573);

    let mut i = 0;
    while i + 8 <= data.len() {
        let m = Wrapping(u64::from_le_bytes([
            data[i],
            data[i + 1],
            data[i + 2],
            data[i + 3],
            data[i + 4],
            data[i + 5],
            data[i + 6],
            data[i + 7],
        ]));

        v3 ^= m;
        sipround(&mut v0, &mut v1, &mut v2, &mut v3);
        sipround(&mut v0, &mut v1, &mut v2, &mut v3);
        v0 ^= m;
        i += 8;
    }

    // Last block: remaining bytes padded with zeros, length in the top byte.
    let remaining = data.len() - i;
    let mut last = Wrapping((data.len() as u64 & 0xFF) << 56);
    for j in 0..remaining {
        last |= Wrapping((data[i + j] as u64) << (j * 8));
    }

    v3 ^= last;
    sipround(&mut v0, &mut v1, &mut v2, &mut v3);
    sipround(&mut v0, &mut v1, &mut v2, &mut v3);
    v0 ^= last;

    v2 ^= Wrapping(0xff);
    for _ in 0..4 {
        sipround(&mut v0, &mut v1, &mut v2, &mut v3);
    }

    (v0 ^ v1 ^ v2 ^ v3).0
}

#[inline(always)]
fn sipround(
    v0: &mut Wrapping<u64>,
    v1: &mut Wrapping<u64>,
    v2: &mut Wrapping<u64>,
    v3: &mut Wrapping<u64>,
) {
    *v0 += *v1;
    *v1 = Wrapping(v1.0.rotate_left(13));
    *v1 ^= *v0;
    *v0 = Wrapping(v0.0.rotate_left(32));

    *v2 += *v3;
    *v3 = Wrapping(v3.0.rotate_left(16));
    *v3 ^= *v2;

    *v0 += *v3;
    *v3 = Wrapping(v3.0.rotate_left(21));
    *v3 ^= *v0;

    *v2 += *v1;
    *v1 = Wrapping(v1.0.rotate_left(17));
    *v1 ^= *v2;
    *v2 = Wrapping(v2.0.rotate_left(32));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_round_trip() {
        let src = Ipv4Addr::new(192, 168, 1, 10);
        let dst = Ipv4Addr::new(10, 20, 30, 40);
        let key = 0x1badb002;

        let isn = syn_cookie(src, dst, 55000, 443, key);
        // A SYN-ACK answering this probe carries ack = isn + 1.
        assert!(verify_cookie(isn.wrapping_add(1), src, dst, 55000, 443, key));
    }

    #[test]
    fn test_cookie_round_trip_many_tuples() {
        let key = 0x0b00b135;
        for host in 1u32..=64 {
            for port in [22u16, 80, 443, 8080] {
                let src = Ipv4Addr::new(172, 16, 0, 1);
                let dst = Ipv4Addr::from(0x0a000000 | host);
                let sp = 40000 + (host as u16);
                let isn = syn_cookie(src, dst, sp, port, key);
                assert!(verify_cookie(isn.wrapping_add(1), src, dst, sp, port, key));
            }
        }
    }

    #[test]
    fn test_cookie_rejects_wrong_tuple() {
        let src = Ipv4Addr::new(192, 168, 1, 10);
        let dst = Ipv4Addr::new(10, 20, 30, 40);
        let key = 0xfeedface;

        let isn = syn_cookie(src, dst, 55000, 443, key);
        // Different dport: different cookie, verification fails.
        assert!(!verify_cookie(isn.wrapping_add(1), src, dst, 55000, 444, key));
        // Different key: also fails.
        assert!(!verify_cookie(isn.wrapping_add(1), src, dst, 55000, 443, key ^ 1));
    }

    #[test]
    fn test_cookie_distinctness_sample() {
        // Distinct tuples should essentially never collide; check a sample.
        let key = 0x12345678;
        let src = Ipv4Addr::new(192, 168, 0, 1);
        let mut seen = std::collections::HashSet::new();
        let mut collisions = 0;
        for host in 0u32..512 {
            let dst = Ipv4Addr::from(0xc0a80100u32.wrapping_add(host));
            let c = syn_cookie(src, dst, 50000, 80, key);
            if !seen.insert(c) {
                collisions += 1;
            }
        }
        assert_eq!(collisions, 0, "unexpected cookie collisions in sample");
    }

    #[test]
    fn test_blackrock_bijective() {
        let br = BlackRock::new(256, 0x123456, 2);

        let mut seen = vec![false; 256];
        for i in 0..256 {
            let shuffled = br.shuffle(i);
            assert!(shuffled < 256, "value {} out of range", shuffled);
            assert!(!seen[shuffled as usize], "collision at {}", shuffled);
            seen[shuffled as usize] = true;
        }
        assert!(seen.iter().all(|&x| x));
    }

    #[test]
    fn test_blackrock_non_power_of_two() {
        let br = BlackRock::new(1000, 0x999, 3);

        let mut seen = vec![false; 1000];
        for i in 0..1000 {
            let shuffled = br.shuffle(i);
            assert!(shuffled < 1000);
            assert!(!seen[shuffled as usize], "collision at {}", shuffled);
            seen[shuffled as usize] = true;
        }
        assert!(seen.iter().all(|&x| x));
    }

    #[test]
    fn test_blackrock_deterministic() {
        let br1 = BlackRock::new(512, 0xABCDEF, 2);
        let br2 = BlackRock::new(512, 0xABCDEF, 2);
        for i in 0..512 {
            assert_eq!(br1.shuffle(i), br2.shuffle(i));
        }
    }

    #[test]
    fn test_siphash24_vectors() {
        let key = [0x0706050403020100, 0x0F0E0D0C0B0A0908];
        assert_eq!(siphash24(b"", &key), 0x726fdb47dd0e0e31);
        assert_eq!(
            siphash24(b"\x00\x01\x02\x03\x04\x05\x06\x07", &key),
            0x93f5f5799a932462
        );
    }

    #[test]
    fn test_siphash24_different_keys() {
        let data = b"probe tuple";
        let h1 = siphash24(data, &[0, 0]);
        let h2 = siphash24(data, &[u64::MAX, u64::MAX]);
        assert_ne!(h1, h2);
    }
}
