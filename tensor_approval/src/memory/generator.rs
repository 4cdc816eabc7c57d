// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process root generation over Shamir shares of an unseal key.
//!
//! The unseal key is split over GF(256) with the AES polynomial. A
//! generation collects shares until the threshold is met, reconstructs the
//! key by Lagrange interpolation, checks it against a stored digest, and on
//! success hands back a fresh root token blinded with the caller's pad.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use super::MemoryControlPlane;
use crate::{
    backend::{GenerationStatus, RootGenerator},
    blinding::{blind, decode_otp, OTP_LEN},
    error::{BackendError, BackendResult},
};

/// Unseal key length in bytes.
pub const UNSEAL_KEY_LEN: usize = 32;

/// Encoded share: x-coordinate followed by one y per key byte.
const SHARE_LEN: usize = UNSEAL_KEY_LEN + 1;

mod gf256 {
    /// Carry-less product folded back modulo x^8 + x^4 + x^3 + x + 1.
    pub const fn mul(a: u8, b: u8) -> u8 {
        let mut wide: u16 = 0;
        let mut bit = 0;
        while bit < 8 {
            if (b >> bit) & 1 == 1 {
                wide ^= (a as u16) << bit;
            }
            bit += 1;
        }
        // Degree is at most 14; clear bits 14..=8 from the top.
        let mut top = 14;
        while top >= 8 {
            if (wide >> top) & 1 == 1 {
                wide ^= 0x11B << (top - 8);
            }
            top -= 1;
        }
        wide as u8
    }

    /// a^254, the inverse of a nonzero `a`.
    pub const fn inv(a: u8) -> u8 {
        if a == 0 {
            return 0;
        }
        let mut result = 1u8;
        let mut base = a;
        let mut exp = 254u8;
        while exp > 0 {
            if exp & 1 != 0 {
                result = mul(result, base);
            }
            base = mul(base, base);
            exp >>= 1;
        }
        result
    }

    /// Horner evaluation; `coeffs[0]` is the constant term.
    pub fn eval_poly(coeffs: &[u8], x: u8) -> u8 {
        coeffs.iter().rev().fold(0u8, |acc, &c| mul(acc, x) ^ c)
    }
}

/// Split `key` into `total` shares, any `threshold` of which recover it.
fn split(key: &[u8; UNSEAL_KEY_LEN], total: u8, threshold: u8) -> BackendResult<Vec<String>> {
    if threshold == 0 || threshold > total {
        return Err(BackendError::Invalid(format!(
            "threshold {threshold} must be between 1 and {total}"
        )));
    }
    let mut shares: Vec<Zeroizing<Vec<u8>>> = (1..=total)
        .map(|x| {
            let mut data = vec![0u8; SHARE_LEN];
            data[0] = x;
            Zeroizing::new(data)
        })
        .collect();

    let mut coeffs = Zeroizing::new(vec![0u8; threshold as usize]);
    for (byte_idx, &secret) in key.iter().enumerate() {
        coeffs[0] = secret;
        rand::thread_rng().fill_bytes(&mut coeffs[1..]);
        for share in &mut shares {
            let x = share[0];
            share[byte_idx + 1] = gf256::eval_poly(&coeffs, x);
        }
    }

    Ok(shares.iter().map(|s| STANDARD.encode(&s[..])).collect())
}

/// Lagrange interpolation at zero. Inputs are validated share bytes.
fn interpolate(shares: &[Zeroizing<Vec<u8>>]) -> Zeroizing<[u8; UNSEAL_KEY_LEN]> {
    let xs: Vec<u8> = shares.iter().map(|s| s[0]).collect();
    let basis: Vec<u8> = (0..xs.len())
        .map(|j| {
            let (mut num, mut den) = (1u8, 1u8);
            for (k, &xk) in xs.iter().enumerate() {
                if k != j {
                    num = gf256::mul(num, xk);
                    den = gf256::mul(den, xs[j] ^ xk);
                }
            }
            gf256::mul(num, gf256::inv(den))
        })
        .collect();

    let mut key = Zeroizing::new([0u8; UNSEAL_KEY_LEN]);
    for (byte_idx, out) in key.iter_mut().enumerate() {
        *out = shares
            .iter()
            .zip(&basis)
            .fold(0u8, |acc, (s, &b)| acc ^ gf256::mul(s[byte_idx + 1], b));
    }
    key
}

struct Generation {
    nonce: String,
    otp: Zeroizing<Vec<u8>>,
    shares: Vec<Zeroizing<Vec<u8>>>,
}

struct Keyring {
    threshold: usize,
    key_digest: [u8; 32],
}

/// [`RootGenerator`] holding one global generation at a time.
pub struct MemoryRootGenerator {
    plane: Arc<MemoryControlPlane>,
    keyring: Mutex<Keyring>,
    generation: Mutex<Option<Generation>>,
    cancels: AtomicUsize,
    completions: AtomicUsize,
}

impl MemoryRootGenerator {
    /// Create a generator over a fresh unseal key and return the shares.
    pub fn new(
        plane: Arc<MemoryControlPlane>,
        total: u8,
        threshold: u8,
    ) -> BackendResult<(Self, Vec<String>)> {
        let (keyring, shares) = Self::fresh_keyring(total, threshold)?;
        let generator = Self {
            plane,
            keyring: Mutex::new(keyring),
            generation: Mutex::new(None),
            cancels: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
        };
        Ok((generator, shares))
    }

    fn fresh_keyring(total: u8, threshold: u8) -> BackendResult<(Keyring, Vec<String>)> {
        let mut key = [0u8; UNSEAL_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        let shares = split(&key, total, threshold);
        let key_digest: [u8; 32] = Sha256::digest(key).into();
        key.zeroize();
        Ok((
            Keyring {
                threshold: threshold as usize,
                key_digest,
            },
            shares?,
        ))
    }

    /// Replace the unseal key with a new split. Old shares stop working.
    pub fn resplit(&self, total: u8, threshold: u8) -> BackendResult<Vec<String>> {
        let (keyring, shares) = Self::fresh_keyring(total, threshold)?;
        *self.keyring.lock() = keyring;
        *self.generation.lock() = None;
        Ok(shares)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn completion_count(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn in_progress(&self) -> bool {
        self.generation.lock().is_some()
    }

    fn decode_share(raw: &str, position: usize) -> BackendResult<Zeroizing<Vec<u8>>> {
        let bytes = Zeroizing::new(STANDARD.decode(raw.trim()).map_err(|_| {
            BackendError::InvalidShare {
                position: Some(position),
                reason: "share is not valid base64".to_string(),
            }
        })?);
        if bytes.len() != SHARE_LEN || bytes[0] == 0 {
            return Err(BackendError::InvalidShare {
                position: Some(position),
                reason: "share has the wrong shape".to_string(),
            });
        }
        Ok(bytes)
    }

    /// Blind a fresh root token and register it with the control plane.
    fn issue_root(&self, otp: &[u8]) -> BackendResult<String> {
        let mut token = Zeroizing::new([0u8; OTP_LEN]);
        rand::thread_rng().fill_bytes(&mut token[..]);
        let encoded = blind(&token[..], otp)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        self.plane
            .register_root(&Uuid::from_bytes(*token).to_string());
        Ok(encoded)
    }
}

impl RootGenerator for MemoryRootGenerator {
    fn required(&self) -> BackendResult<usize> {
        Ok(self.keyring.lock().threshold)
    }

    fn init(&self, otp: &str) -> BackendResult<GenerationStatus> {
        let otp = decode_otp(otp).map_err(|e| BackendError::Invalid(e.to_string()))?;
        let required = self.keyring.lock().threshold;
        let mut generation = self.generation.lock();
        if generation.is_some() {
            return Err(BackendError::Invalid(
                "root generation already in progress".to_string(),
            ));
        }
        let nonce = Uuid::new_v4().to_string();
        *generation = Some(Generation {
            nonce: nonce.clone(),
            otp,
            shares: Vec::new(),
        });
        Ok(GenerationStatus {
            nonce,
            progress: 0,
            required,
            encoded_root: None,
        })
    }

    fn submit_share(&self, share: &str, nonce: &str) -> BackendResult<GenerationStatus> {
        let keyring = self.keyring.lock();
        let mut slot = self.generation.lock();
        let generation = slot
            .as_mut()
            .ok_or_else(|| BackendError::Invalid("no root generation in progress".to_string()))?;
        if generation.nonce != nonce {
            return Err(BackendError::Invalid("nonce mismatch".to_string()));
        }

        let position = generation.shares.len();
        let bytes = Self::decode_share(share, position)?;
        if let Some(seen) = generation.shares.iter().find(|s| s[0] == bytes[0]) {
            // A byte-identical repeat is the newcomer's fault. Two different
            // shares claiming one slot cannot be told apart here.
            let position = (seen[..] == bytes[..]).then_some(position);
            let reason = if position.is_some() {
                "duplicate share"
            } else {
                "conflicting shares for the same key slot"
            };
            *slot = None;
            return Err(BackendError::InvalidShare {
                position,
                reason: reason.to_string(),
            });
        }
        generation.shares.push(bytes);

        let progress = generation.shares.len();
        let status = |encoded_root| GenerationStatus {
            nonce: nonce.to_string(),
            progress,
            required: keyring.threshold,
            encoded_root,
        };
        if progress < keyring.threshold {
            return Ok(status(None));
        }

        let key = interpolate(&generation.shares);
        let digest: [u8; 32] = Sha256::digest(&key[..]).into();
        if digest != keyring.key_digest {
            *slot = None;
            return Err(BackendError::InvalidShare {
                position: None,
                reason: "unable to reconstruct the unseal key from the submitted shares"
                    .to_string(),
            });
        }

        let otp = generation.otp.clone();
        *slot = None;
        let encoded = self.issue_root(&otp)?;
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(status(Some(encoded)))
    }

    fn cancel(&self) -> BackendResult<()> {
        *self.generation.lock() = None;
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
