//! Poseidon sponge over the Pallas base field.
//!
//! Width 3 (rate 2, capacity 1), x^5 S-box, 8 full rounds split around 56
//! partial rounds. Round constants are squeezed from SHAKE128 and the MDS
//! matrix is a Cauchy matrix, so every parameter is reproducible from this
//! file alone. Field-native hashing keeps credit digests cheap to re-check
//! inside an arithmetic circuit.

use pasta_curves::Fp;
use pasta_curves::group::ff::{Field, FromUniformBytes, PrimeField};
use sha3::Shake128;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use std::sync::LazyLock;

pub const WIDTH: usize = 3;
pub const RATE: usize = 2;

const FULL_ROUNDS: usize = 8;
const PARTIAL_ROUNDS: usize = 56;
const ROUND_CONSTANT_SEED: &[u8] = b"taskmesh.poseidon.pallas.rc.v1";
const DOMAIN_PREFIX: &[u8] = b"taskmesh.poseidon.domain/";

struct Params {
    round_constants: Vec<[Fp; WIDTH]>,
    mds: [[Fp; WIDTH]; WIDTH],
}

static PARAMS: LazyLock<Params> = LazyLock::new(Params::generate);

impl Params {
    fn generate() -> Self {
        let mut reader = xof(&[ROUND_CONSTANT_SEED]);
        let round_constants = (0..FULL_ROUNDS + PARTIAL_ROUNDS)
            .map(|_| {
                let mut row = [Fp::ZERO; WIDTH];
                for c in row.iter_mut() {
                    *c = read_element(&mut reader);
                }
                row
            })
            .collect();

        // Cauchy matrix with x_i = i, y_j = WIDTH + j: every x_i + y_j is
        // non-zero and the x and y sets are disjoint.
        let mut mds = [[Fp::ZERO; WIDTH]; WIDTH];
        for (i, row) in mds.iter_mut().enumerate() {
            for (j, entry) in row.iter_mut().enumerate() {
                let denom = Fp::from((i + WIDTH + j) as u64);
                *entry = denom.invert().unwrap_or(Fp::ZERO);
            }
        }

        Self {
            round_constants,
            mds,
        }
    }
}

fn xof(parts: &[&[u8]]) -> impl XofReader {
    let mut hasher = Shake128::default();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize_xof()
}

fn read_element(reader: &mut impl XofReader) -> Fp {
    let mut wide = [0u8; 64];
    reader.read(&mut wide);
    Fp::from_uniform_bytes(&wide)
}

fn sbox(x: Fp) -> Fp {
    x.square().square() * x
}

fn mix(mds: &[[Fp; WIDTH]; WIDTH], state: &[Fp; WIDTH]) -> [Fp; WIDTH] {
    let mut out = [Fp::ZERO; WIDTH];
    for (o, row) in out.iter_mut().zip(mds) {
        *o = row
            .iter()
            .zip(state)
            .fold(Fp::ZERO, |acc, (m, s)| acc + *m * *s);
    }
    out
}

/// The Poseidon permutation.
pub fn permute(state: &mut [Fp; WIDTH]) {
    let params = &*PARAMS;
    let half = FULL_ROUNDS / 2;
    for (round, constants) in params.round_constants.iter().enumerate() {
        for (s, c) in state.iter_mut().zip(constants) {
            *s += *c;
        }
        if round < half || round >= half + PARTIAL_ROUNDS {
            for s in state.iter_mut() {
                *s = sbox(*s);
            }
        } else {
            state[0] = sbox(state[0]);
        }
        *state = mix(&params.mds, state);
    }
}

/// Split 32 bytes into two little-endian 128-bit limbs, each below the modulus.
pub fn bytes_to_limbs(bytes: &[u8; 32]) -> [Fp; 2] {
    let mut lo = [0u8; 16];
    let mut hi = [0u8; 16];
    lo.copy_from_slice(&bytes[..16]);
    hi.copy_from_slice(&bytes[16..]);
    [
        Fp::from_u128(u128::from_le_bytes(lo)),
        Fp::from_u128(u128::from_le_bytes(hi)),
    ]
}

/// Domain-separated sponge. The capacity element carries the domain tag and
/// the input is padded with a single `1` element before the final squeeze.
#[derive(Clone, Debug)]
pub struct Sponge {
    state: [Fp; WIDTH],
    pending: Vec<Fp>,
}

impl Sponge {
    pub fn new(domain: &[u8]) -> Self {
        let tag = read_element(&mut xof(&[DOMAIN_PREFIX, domain]));
        Self {
            state: [Fp::ZERO, Fp::ZERO, tag],
            pending: Vec::with_capacity(RATE),
        }
    }

    pub fn absorb(&mut self, x: Fp) {
        self.pending.push(x);
        if self.pending.len() == RATE {
            self.absorb_block();
        }
    }

    pub fn absorb_u64(&mut self, x: u64) {
        self.absorb(Fp::from(x));
    }

    pub fn absorb_bytes(&mut self, bytes: &[u8; 32]) {
        for limb in bytes_to_limbs(bytes) {
            self.absorb(limb);
        }
    }

    pub fn squeeze(mut self) -> Fp {
        self.pending.push(Fp::ONE);
        while self.pending.len() < RATE {
            self.pending.push(Fp::ZERO);
        }
        self.absorb_block();
        self.state[0]
    }

    fn absorb_block(&mut self) {
        for (s, x) in self.state.iter_mut().zip(self.pending.drain(..)) {
            *s += x;
        }
        permute(&mut self.state);
    }
}

pub fn hash(domain: &[u8], inputs: &[Fp]) -> Fp {
    let mut sponge = Sponge::new(domain);
    for x in inputs {
        sponge.absorb(*x);
    }
    sponge.squeeze()
}
