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

//! Building encrypted request envelopes and opening the responses.

use snafu::{ensure, ResultExt, Snafu};
use zerocopy::IntoBytes;

use crate::{
    crypto::{self, CryptoError},
    guest::{GuestMessage, GuestMessageHeader, MessageType, MAX_PAYLOAD_SIZE},
    keys::{KeyStore, KeyStoreError, Vmpck},
    secrets::{SecretsPage, VmpckId},
};

#[derive(Debug, Snafu)]
pub enum EnvelopeError {
    /// No sequence number is left for another request with this key.
    #[snafu(display("guest message sequence numbers exhausted"))]
    SequenceExhausted { source: KeyStoreError },
    /// The plaintext does not fit in a single message.
    #[snafu(display("payload of {len} bytes exceeds the maximum of {MAX_PAYLOAD_SIZE}"))]
    PayloadTooLarge { len: usize },
    /// Message version 0 is not valid.
    #[snafu(display("invalid message version {version}"))]
    InvalidMessageVersion { version: u8 },
    /// The response does not carry the sequence number that follows the
    /// request's.
    #[snafu(display("unexpected response sequence number {actual}, expected {expected}"))]
    SequenceMismatch { expected: u64, actual: u64 },
    /// The response type is not the request type plus one.
    #[snafu(display("unexpected response message type {actual}, expected {expected}"))]
    TypeMismatch { expected: u8, actual: u8 },
    /// The response version differs from the request version.
    #[snafu(display("unexpected response message version {actual}, expected {expected}"))]
    VersionMismatch { expected: u8, actual: u8 },
    /// A format field of the response header is wrong.
    #[snafu(display("malformed response header: {reason}"))]
    MalformedHeader { reason: &'static str },
    /// The response could not be authenticated.
    #[snafu(display("response authentication failed"))]
    AuthFailure { source: CryptoError },
    /// The request could not be encrypted.
    #[snafu(display("request encryption failed"))]
    Encryption { source: CryptoError },
}

/// Fills `destination` with an encrypted request.
///
/// The request uses the sequence number after the current counter value. The
/// counter itself is not modified; it only moves once the exchange has been
/// finalized.
///
/// Nothing is written to `destination` if the arguments are rejected.
pub fn build_request<S: AsMut<SecretsPage> + AsRef<SecretsPage>>(
    keys: &KeyStore<S>,
    key: &Vmpck,
    message_type: MessageType,
    message_version: u8,
    plaintext: &[u8],
    destination: &mut GuestMessage,
) -> Result<(), EnvelopeError> {
    let sequence_number = keys.next_sequence_number().context(SequenceExhaustedSnafu)?;
    ensure!(plaintext.len() <= MAX_PAYLOAD_SIZE, PayloadTooLargeSnafu { len: plaintext.len() });
    ensure!(message_version != 0, InvalidMessageVersionSnafu { version: message_version });

    encode(keys.id(), key, sequence_number, message_type, message_version, plaintext, destination)
}

/// Encrypts `plaintext` into `destination` with an explicit sequence number.
pub fn encode(
    vmpck_id: VmpckId,
    key: &Vmpck,
    sequence_number: u64,
    message_type: MessageType,
    message_version: u8,
    plaintext: &[u8],
    destination: &mut GuestMessage,
) -> Result<(), EnvelopeError> {
    ensure!(plaintext.len() <= MAX_PAYLOAD_SIZE, PayloadTooLargeSnafu { len: plaintext.len() });

    let mut header = GuestMessageHeader::new();
    header.sequence_number = sequence_number;
    header.auth_header.message_type = message_type as u8;
    header.auth_header.message_version = message_version;
    header.auth_header.message_size = plaintext.len() as u16;
    header.auth_header.message_vmpck = vmpck_id.as_u8();

    destination.payload.fill(0);
    let payload = &mut destination.payload[..plaintext.len()];
    payload.copy_from_slice(plaintext);
    let tag = crypto::encrypt(key, sequence_number, header.auth_header.as_bytes(), payload)
        .context(EncryptionSnafu)?;
    header.set_tag(&tag);
    destination.header = header;
    Ok(())
}

/// Checks that `response` answers `request` and decrypts its payload in place.
///
/// The checks run in this order: sequence number, message type and version,
/// header format, payload size and finally authentication. The returned slice
/// borrows the decrypted payload of `response`.
pub fn parse_response<'a>(
    key: &Vmpck,
    request: &GuestMessageHeader,
    response: &'a mut GuestMessage,
    capacity: usize,
) -> Result<&'a [u8], EnvelopeError> {
    let header = &response.header;

    // A request sequence number that can't be incremented has no valid answer.
    let expected = request.sequence_number.checked_add(1).unwrap_or(0);
    ensure!(
        request.sequence_number != u64::MAX && header.sequence_number == expected,
        SequenceMismatchSnafu { expected, actual: header.sequence_number }
    );

    let expected_type = request.auth_header.message_type.wrapping_add(1);
    ensure!(
        header.auth_header.message_type == expected_type,
        TypeMismatchSnafu { expected: expected_type, actual: header.auth_header.message_type }
    );
    ensure!(
        header.auth_header.message_version == request.auth_header.message_version,
        VersionMismatchSnafu {
            expected: request.auth_header.message_version,
            actual: header.auth_header.message_version,
        }
    );

    header.validate().map_err(|reason| EnvelopeError::MalformedHeader { reason })?;
    ensure!(
        header.auth_header.message_vmpck == request.auth_header.message_vmpck,
        MalformedHeaderSnafu { reason: "invalid VMPCK" }
    );
    let size = header.auth_header.message_size as usize;
    ensure!(size <= capacity, MalformedHeaderSnafu { reason: "response larger than expected" });

    let sequence_number = header.sequence_number;
    let tag = header.tag();
    let aad = response.header.auth_header.clone();
    let payload = &mut response.payload[..size];
    crypto::decrypt(key, sequence_number, aad.as_bytes(), payload, &tag)
        .context(AuthFailureSnafu)?;
    Ok(payload)
}
