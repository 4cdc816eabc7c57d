// SPDX-License-Identifier: MIT OR Apache-2.0
//! One-time-pad blinding for root reconstruction.
//!
//! The reconstruction protocol never returns the root token in the clear.
//! It returns `token XOR otp`, base64 encoded, where `otp` is a random value
//! chosen by us when the generation started. Only the holder of the pad can
//! recover the token.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{ApprovalError, Result};

/// Pad length in bytes; matches the 16-byte root token.
pub const OTP_LEN: usize = 16;

/// A reconstructed root token (zeroized on drop).
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RootSecret {
    token: String,
}

impl RootSecret {
    pub fn expose(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for RootSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootSecret(***)")
    }
}

/// First half of a blinded exchange: holds the pad until the blinded result
/// comes back.
pub struct BlindedReconstruction {
    otp: Zeroizing<[u8; OTP_LEN]>,
    encoded: Zeroizing<String>,
}

impl BlindedReconstruction {
    /// Start an exchange with a fresh random pad.
    pub fn begin() -> Self {
        let mut otp = [0u8; OTP_LEN];
        rand::thread_rng().fill_bytes(&mut otp);
        let exchange = Self::with_otp(otp);
        otp.zeroize();
        exchange
    }

    /// Start an exchange with a caller-chosen pad.
    pub fn with_otp(otp: [u8; OTP_LEN]) -> Self {
        let encoded = Zeroizing::new(STANDARD.encode(otp));
        Self {
            otp: Zeroizing::new(otp),
            encoded,
        }
    }

    /// Base64 pad handed to the protocol's `init`.
    pub fn otp(&self) -> &str {
        &self.encoded
    }

    /// Remove the pad from the protocol's blinded result.
    pub fn complete(self, encoded_root: &str) -> Result<RootSecret> {
        let blinded = Zeroizing::new(STANDARD.decode(encoded_root.trim()).map_err(|_| {
            ApprovalError::Reconstruction(
                "could not decode root token; search for it and revoke it".to_string(),
            )
        })?);
        if blinded.len() != OTP_LEN {
            return Err(ApprovalError::Reconstruction(format!(
                "blinded root token is {} bytes, expected {OTP_LEN}; search for it and revoke it",
                blinded.len()
            )));
        }
        let mut raw = Zeroizing::new([0u8; OTP_LEN]);
        xor_into(&blinded, &self.otp[..], &mut raw[..]);
        let token = Uuid::from_bytes(*raw).to_string();
        Ok(RootSecret { token })
    }
}

/// Blind `token` with `otp`, producing what the protocol hands back.
///
/// Used by protocol implementations; both slices must be [`OTP_LEN`] long.
pub fn blind(token: &[u8], otp: &[u8]) -> Result<String> {
    if token.len() != OTP_LEN || otp.len() != OTP_LEN {
        return Err(ApprovalError::Reconstruction(format!(
            "blinding needs two {OTP_LEN}-byte values"
        )));
    }
    let mut out = Zeroizing::new([0u8; OTP_LEN]);
    xor_into(token, otp, &mut out[..]);
    Ok(STANDARD.encode(&out[..]))
}

/// Decode a base64 pad produced by [`BlindedReconstruction::otp`].
pub fn decode_otp(encoded: &str) -> Result<Zeroizing<Vec<u8>>> {
    let otp = Zeroizing::new(
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| ApprovalError::Validation(format!("otp is not base64: {e}")))?,
    );
    if otp.len() != OTP_LEN {
        return Err(ApprovalError::Validation(format!(
            "otp must be {OTP_LEN} bytes"
        )));
    }
    Ok(otp)
}

fn xor_into(a: &[u8], b: &[u8], out: &mut [u8]) {
    for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
        *o = x ^ y;
    }
}
