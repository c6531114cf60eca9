//! Salt replay filter.
//!
//! Process-wide bag of recently observed connection salts. A salt seen
//! twice within the active window means a replayed handshake, so the
//! reader side of the AEAD stream refuses it before producing plaintext.
//!
//! Two-generation Bloom filter behind a mutex: when the active generation
//! reaches capacity it becomes the previous generation and a fresh one
//! takes over; membership checks consult both. Memory stays bounded no
//! matter how many connections the process has served. False negatives
//! cannot happen inside the two-generation window.

use std::sync::Mutex;

use sha1::{Digest, Sha1};

/// Salts remembered per generation before rotation.
const DEFAULT_CAPACITY: usize = 1_000_000;
/// Target false-positive rate at saturation.
const DEFAULT_FP_RATE: f64 = 1e-6;

struct Bloom {
    bits: Vec<u64>,
    nbits: u64,
    probes: u32,
    count: usize,
}

impl Bloom {
    fn new(capacity: usize, fp_rate: f64) -> Self {
        let ln2 = std::f64::consts::LN_2;
        let nbits = ((-(capacity as f64) * fp_rate.ln()) / (ln2 * ln2)).ceil() as u64;
        let nbits = nbits.max(64);
        let probes = (((nbits as f64) / (capacity as f64)) * ln2).ceil() as u32;
        let probes = probes.max(1);
        Self {
            bits: vec![0u64; nbits.div_ceil(64) as usize],
            nbits,
            probes,
            count: 0,
        }
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.nbits
    }

    fn contains(&self, h1: u64, h2: u64) -> bool {
        (0..self.probes).all(|i| {
            let idx = self.bit_index(h1, h2, i);
            self.bits[(idx / 64) as usize] & (1 << (idx % 64)) != 0
        })
    }

    /// Set the item's bits; count grows only when some bit was new, which
    /// makes repeated adds of the same salt free.
    fn insert(&mut self, h1: u64, h2: u64) {
        let mut newly_set = false;
        for i in 0..self.probes {
            let idx = self.bit_index(h1, h2, i);
            let word = &mut self.bits[(idx / 64) as usize];
            let mask = 1 << (idx % 64);
            if *word & mask == 0 {
                *word |= mask;
                newly_set = true;
            }
        }
        if newly_set {
            self.count += 1;
        }
    }
}

/// Kirsch–Mitzenmacher double hashing over a SHA-1 digest of the salt.
fn hash_pair(salt: &[u8]) -> (u64, u64) {
    let digest = Sha1::digest(salt);
    let h1 = u64::from_le_bytes(digest[0..8].try_into().unwrap());
    // odd h2 so every probe stride visits distinct bits
    let h2 = u64::from_le_bytes(digest[8..16].try_into().unwrap()) | 1;
    (h1, h2)
}

struct Generations {
    current: Bloom,
    previous: Bloom,
}

pub struct SaltFilter {
    capacity: usize,
    fp_rate: f64,
    inner: Mutex<Generations>,
}

impl Default for SaltFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl SaltFilter {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_CAPACITY, DEFAULT_FP_RATE)
    }

    pub fn with_params(capacity: usize, fp_rate: f64) -> Self {
        Self {
            capacity,
            fp_rate,
            inner: Mutex::new(Generations {
                current: Bloom::new(capacity, fp_rate),
                previous: Bloom::new(capacity, fp_rate),
            }),
        }
    }

    /// Whether the salt has been observed within the current window.
    pub fn check(&self, salt: &[u8]) -> bool {
        let (h1, h2) = hash_pair(salt);
        let inner = self.inner.lock().expect("salt filter poisoned");
        inner.current.contains(h1, h2) || inner.previous.contains(h1, h2)
    }

    /// Record a salt; rotates generations when the active one saturates.
    pub fn add(&self, salt: &[u8]) {
        let (h1, h2) = hash_pair(salt);
        let mut inner = self.inner.lock().expect("salt filter poisoned");
        if inner.current.count >= self.capacity {
            let fresh = Bloom::new(self.capacity, self.fp_rate);
            inner.previous = std::mem::replace(&mut inner.current, fresh);
        }
        inner.current.insert(h1, h2);
    }
}
