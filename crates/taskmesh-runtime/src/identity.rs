use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;

use taskmesh_types::{MeshError, PeerId, Result};

/// Key material handed to an entity at startup.
///
/// The peer key fixes the entity's network identity. The payment key is kept
/// as raw bytes and parsed by whoever signs payments, so a malformed key is
/// reported as a signing error at that point.
pub struct Identity {
    peer_key: SigningKey,
    peer_id: PeerId,
    payment_key: Option<Vec<u8>>,
}

impl Identity {
    pub fn from_bytes(peer_key: &[u8], payment_key: Option<&[u8]>) -> Result<Self> {
        let secret: [u8; 32] = peer_key.try_into().map_err(|_| {
            MeshError::Config(format!("peer key must be 32 bytes, got {}", peer_key.len()))
        })?;
        let peer_key = SigningKey::from_bytes(&secret);
        let peer_id = PeerId::from_public_key(&peer_key.verifying_key());
        Ok(Self {
            peer_key,
            peer_id,
            payment_key: payment_key.map(<[u8]>::to_vec),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.peer_key.verifying_key()
    }

    pub fn payment_key(&self) -> Option<&[u8]> {
        self.payment_key.as_deref()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .field("payment_key", &self.payment_key.as_ref().map(|_| ".."))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_stable() {
        let a = Identity::from_bytes(&[1; 32], None).unwrap();
        let b = Identity::from_bytes(&[1; 32], Some(&[2; 32])).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
        assert_eq!(a.peer_id(), &PeerId::from_public_key(&a.verifying_key()));
        assert_ne!(a.peer_id(), Identity::from_bytes(&[3; 32], None).unwrap().peer_id());
    }

    #[test]
    fn test_short_peer_key_rejected() {
        let err = Identity::from_bytes(&[1; 16], None).unwrap_err();
        assert!(matches!(err, MeshError::Config(_)));
    }

    #[test]
    fn test_debug_hides_keys() {
        let id = Identity::from_bytes(&[1; 32], Some(&[9; 32])).unwrap();
        let shown = format!("{id:?}");
        assert!(!shown.contains("9, 9"));
        assert!(shown.contains(id.peer_id().as_str()));
    }
}
