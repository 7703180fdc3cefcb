use pasta_curves::group::ff::{Field, PrimeField};
use pasta_curves::group::{Group, GroupEncoding};
use pasta_curves::pallas::{Point, Scalar};
use std::fmt;

use taskmesh_types::{MeshError, Result};

/// Pallas scalar used to sign payment credits.
///
/// Supplied by the identity collaborator as 32 canonical little-endian bytes.
#[derive(Clone)]
pub struct PaymentSecretKey(Scalar);

impl PaymentSecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let repr: [u8; 32] = bytes.try_into().map_err(|_| {
            MeshError::Signing(format!(
                "payment key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        let scalar = Option::<Scalar>::from(Scalar::from_repr(repr))
            .ok_or_else(|| MeshError::Signing("payment key is not a canonical scalar".into()))?;
        if bool::from(scalar.is_zero()) {
            return Err(MeshError::Signing("payment key is zero".into()));
        }
        Ok(Self(scalar))
    }

    pub fn public_key(&self) -> PaymentPublicKey {
        PaymentPublicKey(Point::generator() * self.0)
    }

    pub(crate) fn scalar(&self) -> &Scalar {
        &self.0
    }
}

impl fmt::Debug for PaymentSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaymentSecretKey(..)")
    }
}

/// Pallas point `G·sk`; what verifiers and recipients hold.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PaymentPublicKey(Point);

impl PaymentPublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let point = Option::<Point>::from(Point::from_bytes(bytes))
            .ok_or_else(|| MeshError::Signing("payment public key is not a curve point".into()))?;
        if bool::from(point.is_identity()) {
            return Err(MeshError::Signing("payment public key is the identity".into()));
        }
        Ok(Self(point))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub(crate) fn point(&self) -> &Point {
        &self.0
    }
}

impl fmt::Debug for PaymentPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentPublicKey({})", hex::encode(self.to_bytes()))
    }
}
