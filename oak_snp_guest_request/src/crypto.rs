//
// Copyright 2024 The Project Oak Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! AES-256-GCM as used for guest messages.
//!
//! The IV is derived from the message sequence number and is never random, so
//! its uniqueness relies entirely on the sequence number never repeating for a
//! key.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use snafu::Snafu;
use zeroize::Zeroize;

use crate::{keys::Vmpck, secrets::VMPCK_SIZE};

/// The size of the AES-GCM IV.
pub const IV_SIZE: usize = 12;

/// The size of the authentication tag produced by AES-GCM.
pub const AUTH_TAG_SIZE: usize = 16;

static_assertions::const_assert_eq!(VMPCK_SIZE, 32);

#[derive(Debug, Snafu)]
pub enum CryptoError {
    /// The payload could not be encrypted.
    #[snafu(display("couldn't encrypt guest message payload"))]
    EncryptionFailure,
    /// The integrity check failed.
    #[snafu(display("guest message authentication failed"))]
    AuthFailure,
}

/// Builds the IV for a sequence number.
///
/// The buffer is zero-filled and the little-endian sequence number is written
/// into its low bytes.
pub fn iv(sequence_number: u64) -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    let bytes = sequence_number.to_le_bytes();
    iv[..bytes.len()].copy_from_slice(&bytes);
    iv
}

fn cipher(key: &Vmpck) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

/// Encrypts `buffer` in place and returns the authentication tag.
pub fn encrypt(
    key: &Vmpck,
    sequence_number: u64,
    associated_data: &[u8],
    buffer: &mut [u8],
) -> Result<[u8; AUTH_TAG_SIZE], CryptoError> {
    let iv = iv(sequence_number);
    let tag = cipher(key)
        .encrypt_in_place_detached(Nonce::from_slice(&iv), associated_data, buffer)
        .map_err(|_| EncryptionFailureSnafu.build())?;
    let mut result = [0u8; AUTH_TAG_SIZE];
    result.copy_from_slice(tag.as_slice());
    Ok(result)
}

/// Decrypts `buffer` in place after checking it and `associated_data` against
/// `tag`.
///
/// On failure the buffer is zeroed.
pub fn decrypt(
    key: &Vmpck,
    sequence_number: u64,
    associated_data: &[u8],
    buffer: &mut [u8],
    tag: &[u8; AUTH_TAG_SIZE],
) -> Result<(), CryptoError> {
    let iv = iv(sequence_number);
    let result = cipher(key).decrypt_in_place_detached(
        Nonce::from_slice(&iv),
        associated_data,
        buffer,
        Tag::from_slice(tag),
    );
    if result.is_err() {
        buffer.zeroize();
        return AuthFailureSnafu.fail();
    }
    Ok(())
}
