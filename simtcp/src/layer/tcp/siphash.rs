//! Initial sequence number generation, as recommended by rfc6528.
//!
//! Uses a keyed cryptographic hash function (SipHash-2-4) instead of appending the secret key to
//! the four tuple for hashing. Hash function SipHash-2-4 from:
//!
//! > SipHash: a fast short-input PRF, Jean-Philippe Aumasson and Daniel J. Bernstein
use super::endpoint::FourTuple;
use crate::time::Instant;
use crate::wire::TcpSeqNumber;

/// An initial sequence number generator based on SipHash-2-4.
///
/// > ISN = M + SipHash-2-4(secretkey, localip, localport, remoteip, remoteport)
///
/// where `M` is the logical time in ticks of 4 microseconds. The hash input is the concatenation
/// of the address octets and the ports in network byte order, so both address families (and the
/// unspecified placeholder of a listener) are covered by one message layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IsnGenerator {
    keys: (u64, u64),
}

// Yes, that's the initial values, as ASCII text.
const IV: [&[u8; 8]; 4] = [
    b"somepseu",
    b"dorandom",
    b"lygenera",
    b"tedbytes"];

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl IsnGenerator {
    /// Create a generator by deriving a key from the standard `RandomState`.
    ///
    /// The numbers `0u64` and `1u64` are each hashed with the same hasher, the two output tags
    /// form the key.
    pub fn from_std_hash() -> Self {
        use std::hash::{Hasher, BuildHasher};
        use std::collections::hash_map::RandomState;

        let hash = RandomState::new().build_hasher();
        let tag = |n: u64| {
            let mut hash = hash.clone();
            hash.write_u64(n);
            hash.finish()
        };

        IsnGenerator {
            keys: (tag(0), tag(1)),
        }
    }

    /// Create a generator with some pre-defined secret key.
    ///
    /// A simulation that wants reproducible runs seeds this from its own configuration.
    pub fn from_secret_key_bytes(bytes: [u8; 16]) -> Self {
        let mut k0 = [0; 8];
        let mut k1 = [0; 8];
        k0.copy_from_slice(&bytes[..8]);
        k1.copy_from_slice(&bytes[8..]);
        IsnGenerator {
            keys: (u64::from_le_bytes(k0), u64::from_le_bytes(k1)),
        }
    }

    /// Get the initial sequence number for a connection.
    ///
    /// The value advances every 4 microseconds of logical time and differs between tuples.
    pub fn get_isn(&self, connection: FourTuple, time: Instant) -> TcpSeqNumber {
        let mut message = Vec::with_capacity(36);
        message.extend_from_slice(connection.local.as_bytes());
        message.extend_from_slice(&connection.local_port.to_be_bytes());
        message.extend_from_slice(connection.remote.as_bytes());
        message.extend_from_slice(&connection.remote_port.to_be_bytes());

        let ticks = (time.total_micros() / 4) as u32;
        let isn = (self.hash(&message) as u32).wrapping_add(ticks);
        TcpSeqNumber::from(isn)
    }

    /// SipHash-2-4 of an arbitrary message of less than 256 bytes.
    fn hash(&self, message: &[u8]) -> u64 {
        let mut state = State::init(self.keys.0, self.keys.1);
        let mut words = message.chunks_exact(8);
        for word in &mut words {
            let mut block = [0; 8];
            block.copy_from_slice(word);
            state.absorb(u64::from_le_bytes(block));
        }

        // The last block carries the remainder and the message length in its top byte.
        let rest = words.remainder();
        let mut last = [0; 8];
        last[..rest.len()].copy_from_slice(rest);
        last[7] = message.len() as u8;
        state.absorb(u64::from_le_bytes(last));
        state.finalize()
    }
}

impl State {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    /// Process a single 8-byte block of the message.
    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    /// Do the finalization rounds.
    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}
