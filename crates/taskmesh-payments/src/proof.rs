//! Batch proofs over signed payments.
//!
//! A batch proof is a half-aggregated Schnorr signature: the per-payment
//! responses `s_i` are folded into one scalar with transcript-derived weights
//! `z_i`, while the commitments `R_i` stay public. Checking the whole batch is
//! a single group equation
//!
//! ```text
//! (Σ z_i·s_i)·G == Σ z_i·R_i + (Σ z_i·c_i)·PK
//! ```
//!
//! and reveals nothing about the signing key beyond the signatures' own
//! public parts. Public inputs also commit to the credits with a SHA-256
//! Merkle root so a recipient can show one payment without the rest.

use chrono::{DateTime, Utc};
use pasta_curves::Fp;
use pasta_curves::group::ff::{Field, PrimeField};
use pasta_curves::group::{Group, GroupEncoding};
use pasta_curves::pallas::{Point, Scalar};
use rs_merkle::{Hasher, MerkleProof, MerkleTree, algorithms::Sha256};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::keys::PaymentPublicKey;
use crate::poseidon::{self, Sponge};
use crate::signer::{base_to_scalar, challenge, credit_digest, decode};
use taskmesh_types::{MeshError, PaymentCredit, Recipient, Result, SignedPayment};

const TRANSCRIPT_DOMAIN: &[u8] = b"taskmesh.batch.transcript.v1";
const WEIGHT_DOMAIN: &[u8] = b"taskmesh.batch.weight.v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProof {
    pub id: Uuid,
    /// Fixed batch size the proof was generated for.
    pub arity: usize,
    pub commitments: Vec<[u8; 32]>,
    pub aggregate_response: [u8; 32],
    pub transcript: [u8; 32],
    pub created_at: DateTime<Utc>,
}

/// What the settlement verifier needs alongside the proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicInputs {
    pub signer: [u8; 32],
    pub credits: Vec<PaymentCredit>,
    pub merkle_root: [u8; 32],
}

impl PublicInputs {
    pub fn position(&self, recipient: &Recipient, nonce: u64) -> Option<usize> {
        self.credits
            .iter()
            .position(|c| &c.recipient == recipient && c.nonce == nonce)
    }

    /// Serialized Merkle proof that the credit at `index` is in this batch.
    pub fn inclusion_proof(&self, index: usize) -> Option<Vec<u8>> {
        if index >= self.credits.len() {
            return None;
        }
        let tree = merkle_tree(&self.credits);
        Some(tree.proof(&[index]).to_bytes())
    }

    pub fn total_value(&self) -> u128 {
        self.credits.iter().map(|c| u128::from(c.amount)).sum()
    }
}

fn credit_leaf(credit: &PaymentCredit) -> [u8; 32] {
    Sha256::hash(&credit.to_bytes())
}

fn merkle_tree(credits: &[PaymentCredit]) -> MerkleTree<Sha256> {
    let leaves: Vec<[u8; 32]> = credits.iter().map(credit_leaf).collect();
    MerkleTree::<Sha256>::from_leaves(&leaves)
}

pub fn merkle_root(credits: &[PaymentCredit]) -> [u8; 32] {
    merkle_tree(credits).root().unwrap_or([0u8; 32])
}

/// Check a recipient's inclusion proof against a batch's Merkle root.
pub fn verify_inclusion(
    root: &[u8; 32],
    credit: &PaymentCredit,
    index: usize,
    total: usize,
    proof: &[u8],
) -> bool {
    match MerkleProof::<Sha256>::from_bytes(proof) {
        Ok(proof) => proof.verify(*root, &[index], &[credit_leaf(credit)], total),
        Err(_) => false,
    }
}

fn transcript(
    arity: usize,
    signer: &[u8; 32],
    digests: &[Fp],
    commitments: &[[u8; 32]],
) -> Fp {
    let mut sponge = Sponge::new(TRANSCRIPT_DOMAIN);
    sponge.absorb_u64(arity as u64);
    sponge.absorb_u64(digests.len() as u64);
    sponge.absorb_bytes(signer);
    for digest in digests {
        sponge.absorb(*digest);
    }
    for r in commitments {
        sponge.absorb_bytes(r);
    }
    sponge.squeeze()
}

fn weight(transcript: Fp, index: usize) -> Scalar {
    base_to_scalar(poseidon::hash(
        WEIGHT_DOMAIN,
        &[transcript, Fp::from(index as u64)],
    ))
}

/// Generate a batch proof. Every signature is checked first; any bad or
/// duplicate payment rejects the whole batch.
pub fn prove(
    signer: &PaymentPublicKey,
    payments: &[SignedPayment],
    arity: usize,
) -> Result<(BatchProof, PublicInputs)> {
    if payments.is_empty() {
        return Err(MeshError::ProofGeneration("empty batch".into()));
    }
    if payments.len() > arity {
        return Err(MeshError::ProofGeneration(format!(
            "batch of {} exceeds arity {arity}",
            payments.len()
        )));
    }

    let mut seen = HashSet::with_capacity(payments.len());
    let mut decoded = Vec::with_capacity(payments.len());
    for (i, payment) in payments.iter().enumerate() {
        let credit = &payment.credit;
        if !seen.insert((credit.recipient, credit.nonce)) {
            return Err(MeshError::ProofGeneration(format!(
                "duplicate nonce {} for recipient {} at index {i}",
                credit.nonce, credit.recipient
            )));
        }
        let d = decode(signer, payment)
            .filter(|d| Point::generator() * d.s == d.r + *signer.point() * d.c)
            .ok_or_else(|| {
                MeshError::ProofGeneration(format!(
                    "invalid signature at index {i} (nonce {})",
                    credit.nonce
                ))
            })?;
        decoded.push(d);
    }

    let signer_bytes = signer.to_bytes();
    let digests: Vec<Fp> = payments.iter().map(|p| credit_digest(&p.credit)).collect();
    let commitments: Vec<[u8; 32]> = payments.iter().map(|p| p.signature.r).collect();
    let t = transcript(arity, &signer_bytes, &digests, &commitments);

    let aggregate = decoded
        .iter()
        .enumerate()
        .fold(Scalar::ZERO, |acc, (i, d)| acc + weight(t, i) * d.s);

    let credits: Vec<PaymentCredit> = payments.iter().map(|p| p.credit).collect();
    let inputs = PublicInputs {
        signer: signer_bytes,
        merkle_root: merkle_root(&credits),
        credits,
    };
    let proof = BatchProof {
        id: Uuid::new_v4(),
        arity,
        commitments,
        aggregate_response: aggregate.to_repr(),
        transcript: t.to_repr(),
        created_at: Utc::now(),
    };
    Ok((proof, inputs))
}

/// Check a batch proof against its public inputs in one aggregate equation.
pub fn verify_batch(proof: &BatchProof, inputs: &PublicInputs) -> bool {
    let n = inputs.credits.len();
    if n == 0 || n > proof.arity || proof.commitments.len() != n {
        return false;
    }
    if merkle_root(&inputs.credits) != inputs.merkle_root {
        return false;
    }
    let Ok(signer) = PaymentPublicKey::from_bytes(&inputs.signer) else {
        return false;
    };

    let digests: Vec<Fp> = inputs.credits.iter().map(credit_digest).collect();
    let t = transcript(proof.arity, &inputs.signer, &digests, &proof.commitments);
    if t.to_repr() != proof.transcript {
        return false;
    }
    let Some(aggregate) = Option::<Scalar>::from(Scalar::from_repr(proof.aggregate_response))
    else {
        return false;
    };

    let mut rhs = Point::identity();
    let mut challenge_sum = Scalar::ZERO;
    for (i, (r_bytes, digest)) in proof.commitments.iter().zip(&digests).enumerate() {
        let Some(r) = Option::<Point>::from(Point::from_bytes(r_bytes)) else {
            return false;
        };
        let z = weight(t, i);
        rhs += r * z;
        challenge_sum += z * challenge(r_bytes, &inputs.signer, *digest);
    }
    rhs += *signer.point() * challenge_sum;

    Point::generator() * aggregate == rhs
}
