#![forbid(unsafe_code)]

use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// The only accepted RSA modulus length.
pub const MODULUS_BITS: usize = 2048;

/// Length of the random login-challenge nonce.
pub const CHALLENGE_NONCE_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum KeyError {
	#[error("Public key is not a valid PEM-encoded PKCS#1 RSA key")]
	InvalidPem,

	#[error("Size of public key modulus is {bits} bits, expected 2048 bits")]
	WrongModulusSize {
		bits: usize,
	},

	#[error("Could not encode public key")]
	Encode,

	#[error("Challenge encryption failed: {0}")]
	Encrypt(#[from] rsa::Error),
}

/// Parse a PEM-encoded PKCS#1 RSA public key, rejecting anything whose
/// modulus is not exactly 2048 bits.
pub fn parse_public_key(pem: &[u8]) -> Result<RsaPublicKey, KeyError> {
	let text = std::str::from_utf8(pem).map_err(|_| KeyError::InvalidPem)?;
	let key = RsaPublicKey::from_pkcs1_pem(text).map_err(|_| KeyError::InvalidPem)?;

	let bits = key.n().bits();
	if bits != MODULUS_BITS {
		return Err(KeyError::WrongModulusSize { bits });
	}

	Ok(key)
}

/// Encode an RSA public key as PKCS#1 PEM bytes, the canonical byte form
/// stored for registered users and shown to room members.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<Vec<u8>, KeyError> {
	key.to_pkcs1_pem(LineEnding::LF)
		.map(String::into_bytes)
		.map_err(|_| KeyError::Encode)
}

/// A freshly generated login challenge.
///
/// The plaintext nonce stays on the server, bound to one connection; only
/// the ciphertext goes on the wire.
pub struct Challenge {
	pub nonce: Vec<u8>,
	pub ciphertext: Vec<u8>,
}

/// Generate a 64-byte random nonce and encrypt it with RSA PKCS#1 v1.5
/// under the caller's public key.
pub fn generate_challenge(key: &RsaPublicKey) -> Result<Challenge, KeyError> {
	let mut rng = rand::thread_rng();
	let mut nonce = vec![0u8; CHALLENGE_NONCE_LEN];
	rng.fill_bytes(&mut nonce);

	let ciphertext = key.encrypt(&mut rng, Pkcs1v15Encrypt, &nonce)?;
	Ok(Challenge { nonce, ciphertext })
}

/// Constant-time comparison of a challenge response against the stored
/// nonce.
pub fn verify_response(nonce: &[u8], response: &[u8]) -> bool {
	nonce.ct_eq(response).into()
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use rsa::RsaPrivateKey;

	use super::*;

	fn keypair(bits: usize) -> (RsaPrivateKey, RsaPublicKey) {
		let mut rng = rand::thread_rng();
		let private = RsaPrivateKey::new(&mut rng, bits).expect("generate key");
		let public = private.to_public_key();
		(private, public)
	}

	#[test]
	fn roundtrip_2048_bit_key() {
		let (_, public) = keypair(2048);
		let pem = encode_public_key(&public).expect("encode");
		let parsed = parse_public_key(&pem).expect("parse");
		assert_eq!(parsed, public);
	}

	#[test]
	fn rejects_garbage() {
		assert!(matches!(parse_public_key(b"not a key"), Err(KeyError::InvalidPem)));
		assert!(matches!(parse_public_key(&[0xff, 0xfe]), Err(KeyError::InvalidPem)));
	}

	#[test]
	fn rejects_wrong_modulus_sizes() {
		let (_, small) = keypair(512);
		let pem = encode_public_key(&small).expect("encode");
		assert!(matches!(
			parse_public_key(&pem),
			Err(KeyError::WrongModulusSize { bits: 512 })
		));

		let (_, big) = keypair(4096);
		let pem = encode_public_key(&big).expect("encode");
		assert!(matches!(
			parse_public_key(&pem),
			Err(KeyError::WrongModulusSize { bits: 4096 })
		));
	}

	#[test]
	fn challenge_decrypts_to_nonce() {
		let (private, public) = keypair(2048);
		let challenge = generate_challenge(&public).expect("challenge");

		let decrypted = private
			.decrypt(Pkcs1v15Encrypt, &challenge.ciphertext)
			.expect("decrypt");
		assert_eq!(decrypted, challenge.nonce);
		assert_eq!(challenge.nonce.len(), CHALLENGE_NONCE_LEN);
		assert!(verify_response(&challenge.nonce, &decrypted));
	}

	#[test]
	fn verify_rejects_wrong_response() {
		let (_, public) = keypair(2048);
		let challenge = generate_challenge(&public).expect("challenge");

		let mut tampered = challenge.nonce.clone();
		tampered[0] ^= 1;
		assert!(!verify_response(&challenge.nonce, &tampered));
		assert!(!verify_response(&challenge.nonce, &challenge.nonce[..32]));
		assert!(!verify_response(&challenge.nonce, b""));
	}

	#[test]
	fn nonces_are_distinct() {
		let (_, public) = keypair(2048);

		let mut seen = HashSet::new();
		for _ in 0..1000 {
			let challenge = generate_challenge(&public).expect("challenge");
			assert!(seen.insert(challenge.nonce), "duplicate nonce generated");
		}
	}
}
