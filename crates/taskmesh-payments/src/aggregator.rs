use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};

use crate::config::PaymentConfig;
use crate::keys::PaymentPublicKey;
use crate::proof::{self, BatchProof, PublicInputs};
use taskmesh_types::{MeshError, Result, SignedPayment};

/// A proven batch, ready for the settlement collaborator.
#[derive(Debug, Clone)]
pub struct SealedBatch {
    pub proof: BatchProof,
    pub inputs: PublicInputs,
    pub payments: Vec<SignedPayment>,
}

/// Collects signed payments and turns them into batch proofs.
///
/// Proof generation is CPU-bound: it runs on the blocking pool, bounded by a
/// semaphore, and once started it always runs to completion or failure.
pub struct BatchProofAggregator {
    public: PaymentPublicKey,
    batch_size: usize,
    buffer: Mutex<Vec<SignedPayment>>,
    permits: Arc<Semaphore>,
}

impl BatchProofAggregator {
    pub fn new(public: PaymentPublicKey, config: &PaymentConfig) -> Self {
        Self {
            public,
            batch_size: config.batch_size,
            buffer: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(config.proof_workers.max(1))),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Add a payment. Returns a full batch once `batch_size` is reached.
    pub async fn push(&self, payment: SignedPayment) -> Option<Vec<SignedPayment>> {
        let mut buffer = self.buffer.lock().await;
        buffer.push(payment);
        if buffer.len() < self.batch_size {
            return None;
        }
        Some(buffer.drain(..self.batch_size).collect())
    }

    /// Take whatever is buffered, as a partial batch.
    pub async fn drain(&self) -> Option<Vec<SignedPayment>> {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *buffer))
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Generate the proof for one batch off the async executor.
    ///
    /// On error nothing is emitted; the caller still owns `payments` and
    /// decides what to do with their credits.
    pub async fn seal(&self, payments: &[SignedPayment]) -> Result<SealedBatch> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MeshError::Internal(format!("proof worker pool closed: {e}")))?;

        let public = self.public;
        let arity = self.batch_size;
        let owned = payments.to_vec();
        let started = Instant::now();
        let (proof, inputs) = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            proof::prove(&public, &owned, arity)
        })
        .await
        .map_err(|e| MeshError::ProofGeneration(format!("proof worker failed: {e}")))??;

        tracing::info!(
            batch_id = %proof.id,
            payments = payments.len(),
            arity,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch proof generated"
        );
        Ok(SealedBatch {
            proof,
            inputs,
            payments: payments.to_vec(),
        })
    }
}
