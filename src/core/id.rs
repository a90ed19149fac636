use ethereum_types::H256;
use std::cmp::Ordering;
use std::ops::BitXor;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of bits in an identifier.
pub const ID_BITS: usize = 256;

/// A fresh random token attached to each outgoing request so the matching
/// response can be recognized (and stray responses rejected).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId([u8; 32]);

impl RequestId {
    pub fn new_random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RequestId({:02x}{:02x}{:02x}{:02x}…)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// A 256-bit identifier, used both for peer identity and key addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(pub H256);

impl Id {
    /// Randomly generate a new id.
    pub fn new_random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        Id(H256::from(bytes))
    }

    pub fn zero() -> Self {
        Id(H256::zero())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(H256::from_slice(bytes))
    }

    /// Derive an id by hashing arbitrary input, e.g. a public key or a
    /// document's content.
    pub fn from_hashed<S: AsRef<[u8]>>(input: &S) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(input.as_ref());
        let digest = hasher.finalize();
        Self(H256::from_slice(&digest))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn get_bit_at(&self, bit_index: usize) -> u8 {
        let bytes = self.0.as_bytes();
        let byte_index = bit_index / 8;
        let bit_within_byte = bit_index % 8;
        let shift_amount = 7 - bit_within_byte;
        (bytes[byte_index] >> shift_amount) & 1u8
    }

    /// Create a copy of this id but with a given bit set to a given value.
    /// Useful when splitting buckets and assigning the new buckets' prefixes.
    pub fn with_bit(&self, bit_index: usize, bit: u8) -> Self {
        let mut bytes: [u8; 32] = *self.0.as_fixed_bytes();

        let byte_index = bit_index / 8;
        let bit_within_byte = bit_index % 8;
        let shift_amount = 7 - bit_within_byte;

        if bit == 1 {
            bytes[byte_index] |= 1 << shift_amount;
        } else {
            bytes[byte_index] &= !(1 << shift_amount);
        }

        Id(H256::from(bytes))
    }

    pub fn distance(&self, other: &Id) -> Distance {
        Distance(self.0 ^ other.0)
    }

    /// Length of the binary prefix this id shares with `other`, in bits.
    /// Equal ids share all `ID_BITS` bits.
    pub fn common_prefix_len(&self, other: &Id) -> usize {
        let mut len = 0;
        for (a, b) in self.0.as_bytes().iter().zip(other.0.as_bytes()) {
            let x = a ^ b;
            if x == 0 {
                len += 8;
            } else {
                len += x.leading_zeros() as usize;
                break;
            }
        }
        len
    }

    /// Compare two ids by their distance to `self`. Ties (only possible when
    /// `p == q`) fall back to lexicographic id order.
    pub fn compare_by_distance(&self, p: &Id, q: &Id) -> Ordering {
        p.distance(self)
            .cmp(&q.distance(self))
            .then_with(|| p.cmp(q))
    }

    /// Return a short, human-friendly hex for logging, like ab12cd34…ef90a1b2
    pub fn short_hex(&self) -> String {
        let b = self.0.to_fixed_bytes();
        format!(
            "{:02x}{:02x}{:02x}{:02x}…{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[28], b[29], b[30], b[31]
        )
    }
}

impl BitXor for Id {
    type Output = Id;

    fn bitxor(self, rhs: Self) -> Self::Output {
        Id(self.0 ^ rhs.0)
    }
}

/// An id is also how keys are addressed.
pub type Key = Id;

/// XOR distance between two ids, compared as an unsigned 256-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(H256);

/// Construct a random id whose first `depth` bits match `prefix`.
/// Used to probe under-populated or stale buckets.
pub fn random_with_prefix(prefix: Option<Id>, depth: usize) -> Id {
    if depth == 0 {
        return Id::new_random();
    }
    let p = prefix.expect("prefix must exist when depth > 0");
    let mut id = Id::new_random();
    for i in 0..depth {
        id = id.with_bit(i, p.get_bit_at(i));
    }
    id
}
