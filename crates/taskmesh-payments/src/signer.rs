use pasta_curves::Fp;
use pasta_curves::group::ff::{Field, FromUniformBytes, PrimeField};
use pasta_curves::group::{Group, GroupEncoding};
use pasta_curves::pallas::{Point, Scalar};
use sha2::{Digest, Sha512};

use crate::keys::{PaymentPublicKey, PaymentSecretKey};
use crate::poseidon::Sponge;
use taskmesh_types::{MeshError, PaymentCredit, Result, Signature, SignedPayment};

const CREDIT_DOMAIN: &[u8] = b"taskmesh.credit.v1";
const CHALLENGE_DOMAIN: &[u8] = b"taskmesh.schnorr.challenge.v1";
const NONCE_DOMAIN: &[u8] = b"taskmesh.schnorr.nonce.v1";

/// Poseidon digest of `(nonce, recipient, amount)`.
pub fn credit_digest(credit: &PaymentCredit) -> Fp {
    let (lo, hi) = credit.recipient.limbs();
    let mut sponge = Sponge::new(CREDIT_DOMAIN);
    sponge.absorb_u64(credit.nonce);
    sponge.absorb(Fp::from_u128(lo));
    sponge.absorb(Fp::from_u128(hi));
    sponge.absorb_u64(credit.amount);
    sponge.squeeze()
}

/// Fiat-Shamir challenge `H(R, PK, m)` mapped into the scalar field.
pub(crate) fn challenge(r: &[u8; 32], public: &[u8; 32], digest: Fp) -> Scalar {
    let mut sponge = Sponge::new(CHALLENGE_DOMAIN);
    sponge.absorb_bytes(r);
    sponge.absorb_bytes(public);
    sponge.absorb(digest);
    base_to_scalar(sponge.squeeze())
}

pub(crate) fn base_to_scalar(x: Fp) -> Scalar {
    let mut wide = [0u8; 64];
    wide[..32].copy_from_slice(&x.to_repr());
    Scalar::from_uniform_bytes(&wide)
}

/// Signs payment credits with the entity's payment key.
///
/// Schnorr over Pallas with a Poseidon message digest and challenge, so a
/// verifier circuit needs only native field arithmetic. Nonces are derived
/// deterministically from the key and the digest.
#[derive(Debug, Clone)]
pub struct PaymentSigner {
    secret: PaymentSecretKey,
    public: PaymentPublicKey,
}

impl PaymentSigner {
    pub fn new(secret: PaymentSecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Build a signer from externally supplied key bytes.
    pub fn from_key_bytes(key: Option<&[u8]>) -> Result<Self> {
        let bytes = key.ok_or_else(|| MeshError::Signing("no payment key configured".into()))?;
        Ok(Self::new(PaymentSecretKey::from_bytes(bytes)?))
    }

    pub fn public_key(&self) -> PaymentPublicKey {
        self.public
    }

    pub fn sign(&self, credit: &PaymentCredit) -> Result<SignedPayment> {
        let digest = credit_digest(credit);
        let sk = self.secret.scalar();

        let mut hasher = Sha512::new();
        hasher.update(NONCE_DOMAIN);
        hasher.update(sk.to_repr());
        hasher.update(digest.to_repr());
        let mut wide = [0u8; 64];
        wide.copy_from_slice(&hasher.finalize());
        let k = Scalar::from_uniform_bytes(&wide);
        if bool::from(k.is_zero()) {
            return Err(MeshError::Signing("derived a zero signing nonce".into()));
        }

        let r = (Point::generator() * k).to_bytes();
        let c = challenge(&r, &self.public.to_bytes(), digest);
        let s = k + c * sk;

        Ok(SignedPayment {
            credit: *credit,
            signature: Signature {
                r,
                s: s.to_repr(),
            },
        })
    }
}

/// Sign with raw key material; fails if the key is absent or malformed.
pub fn sign(credit: &PaymentCredit, key: Option<&[u8]>) -> Result<SignedPayment> {
    PaymentSigner::from_key_bytes(key)?.sign(credit)
}

/// Parsed signature components, shared with batch aggregation.
pub(crate) struct Decoded {
    pub r: Point,
    pub s: Scalar,
    pub c: Scalar,
}

pub(crate) fn decode(public: &PaymentPublicKey, payment: &SignedPayment) -> Option<Decoded> {
    let r = Option::<Point>::from(Point::from_bytes(&payment.signature.r))?;
    let s = Option::<Scalar>::from(Scalar::from_repr(payment.signature.s))?;
    let c = challenge(
        &payment.signature.r,
        &public.to_bytes(),
        credit_digest(&payment.credit),
    );
    Some(Decoded { r, s, c })
}

/// Check `s·G == R + c·PK` for a single payment.
pub fn verify(public: &PaymentPublicKey, payment: &SignedPayment) -> bool {
    match decode(public, payment) {
        Some(d) => Point::generator() * d.s == d.r + *public.point() * d.c,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_keys::random_secret;
    use taskmesh_types::Recipient;

    fn credit(nonce: u64, amount: u64) -> PaymentCredit {
        PaymentCredit::new(nonce, Recipient::new([3; 32]), amount)
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = PaymentSigner::new(random_secret());
        let signed = signer.sign(&credit(6, 10)).unwrap();
        assert!(verify(&signer.public_key(), &signed));
    }

    #[test]
    fn test_tampered_amount_fails_verification() {
        let signer = PaymentSigner::new(random_secret());
        let mut signed = signer.sign(&credit(6, 10)).unwrap();
        signed.credit.amount = 11;
        assert!(!verify(&signer.public_key(), &signed));
    }

    #[test]
    fn test_tampered_nonce_and_recipient_fail_verification() {
        let signer = PaymentSigner::new(random_secret());
        let signed = signer.sign(&credit(6, 10)).unwrap();

        let mut replayed = signed;
        replayed.credit.nonce = 7;
        assert!(!verify(&signer.public_key(), &replayed));

        let mut redirected = signed;
        redirected.credit.recipient = Recipient::new([4; 32]);
        assert!(!verify(&signer.public_key(), &redirected));
    }

    #[test]
    fn test_wrong_public_key_fails_verification() {
        let signer = PaymentSigner::new(random_secret());
        let other = PaymentSigner::new(random_secret());
        let signed = signer.sign(&credit(1, 1)).unwrap();
        assert!(!verify(&other.public_key(), &signed));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let signer = PaymentSigner::new(random_secret());
        let a = signer.sign(&credit(1, 5)).unwrap();
        let b = signer.sign(&credit(1, 5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_key_is_signing_error() {
        let err = sign(&credit(1, 1), None).unwrap_err();
        assert!(matches!(err, MeshError::Signing(_)));
    }

    #[test]
    fn test_malformed_key_is_signing_error() {
        let err = sign(&credit(1, 1), Some(&[0xff; 32][..])).unwrap_err();
        assert!(matches!(err, MeshError::Signing(_)));
        assert!(sign(&credit(1, 1), Some(&[1u8; 5][..])).is_err());
    }

    #[test]
    fn test_garbage_signature_bytes_do_not_verify() {
        let signer = PaymentSigner::new(random_secret());
        let mut signed = signer.sign(&credit(1, 1)).unwrap();
        signed.signature.s = [0xff; 32];
        assert!(!verify(&signer.public_key(), &signed));
    }
}
