use serde::{Deserialize, Serialize};

use crate::ids::Recipient;

/// An unsigned record of payment owed for one validated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentCredit {
    pub nonce: u64,
    pub recipient: Recipient,
    pub amount: u64,
}

impl PaymentCredit {
    pub fn new(nonce: u64, recipient: Recipient, amount: u64) -> Self {
        Self {
            nonce,
            recipient,
            amount,
        }
    }

    /// Canonical byte encoding: nonce (LE) || recipient || amount (LE).
    pub fn to_bytes(&self) -> [u8; 48] {
        let mut out = [0u8; 48];
        out[..8].copy_from_slice(&self.nonce.to_le_bytes());
        out[8..40].copy_from_slice(self.recipient.as_bytes());
        out[40..].copy_from_slice(&self.amount.to_le_bytes());
        out
    }
}

/// Schnorr signature: compressed commitment point and response scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayment {
    pub credit: PaymentCredit,
    pub signature: Signature,
}
