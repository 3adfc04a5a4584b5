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

//! Access to the VM platform communication keys and their message sequence
//! counters.

use snafu::{ensure, Snafu};
use zeroize::{Zeroize, Zeroizing};

use crate::secrets::{SecretsPage, VmpckId, VMPCK_SIZE};

/// The amount by which the sequence counter moves after every round trip.
///
/// The request uses `counter + 1` and the response `counter + 2`, so the
/// firmware's own counter ends up 2 ahead as well.
pub const SEQUENCE_NUMBER_STEP: u32 = 2;

#[derive(Debug, Snafu)]
pub enum KeyStoreError {
    /// The secrets page failed validation.
    #[snafu(display("invalid secrets page: {reason}"))]
    InvalidSecretsPage { reason: &'static str },
    /// The key slot has not been provisioned.
    #[snafu(display("VMPCK{id} is not provisioned"))]
    InvalidKey { id: u8 },
    /// Using another sequence number would overflow the 32-bit counter.
    #[snafu(display("guest message sequence counter exhausted"))]
    SequenceExhausted,
}

/// A VM platform communication key owned by the session.
///
/// The bytes are zeroed when the key is dropped or wiped.
pub struct Vmpck(Zeroizing<[u8; VMPCK_SIZE]>);

impl Vmpck {
    pub fn new(bytes: [u8; VMPCK_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; VMPCK_SIZE] {
        &self.0
    }

    pub fn wipe(&mut self) {
        self.0.zeroize();
    }

    pub fn is_wiped(&self) -> bool {
        self.0.iter().all(|&byte| byte == 0)
    }
}

impl core::fmt::Debug for Vmpck {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Vmpck(..)")
    }
}

/// One key slot of the secrets page together with its sequence counter.
///
/// The sequence counter is the only source of IV material for the key, so it
/// must never go backwards and every value handed out by
/// `KeyStore::next_sequence_number` is used at most once.
pub struct KeyStore<S: AsMut<SecretsPage> + AsRef<SecretsPage>> {
    secrets: S,
    id: VmpckId,
}

impl<S: AsMut<SecretsPage> + AsRef<SecretsPage>> KeyStore<S> {
    /// Selects the key slot `id` of the secrets page.
    ///
    /// Fails if the page does not validate or the slot is all zeroes, which
    /// is what an unprovisioned key looks like.
    pub fn new(secrets: S, id: VmpckId) -> Result<Self, KeyStoreError> {
        secrets.as_ref().validate().map_err(|reason| KeyStoreError::InvalidSecretsPage { reason })?;
        let store = Self { secrets, id };
        ensure!(!store.is_empty(), InvalidKeySnafu { id: id.as_u8() });
        Ok(store)
    }

    pub fn id(&self) -> VmpckId {
        self.id
    }

    /// Copies the key out of the secrets page.
    pub fn key(&self) -> Vmpck {
        Vmpck::new(*self.secrets.as_ref().vmpck(self.id))
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.as_ref().vmpck(self.id).iter().all(|&byte| byte == 0)
    }

    /// The value of the persisted counter.
    pub fn sequence_number(&self) -> u32 {
        self.secrets.as_ref().sequence_number(self.id)
    }

    /// The sequence number to use for the next request.
    ///
    /// The response to that request will carry the number after it, which
    /// must still fit the 32-bit counter.
    pub fn next_sequence_number(&self) -> Result<u64, KeyStoreError> {
        let next = u64::from(self.sequence_number()) + 1;
        ensure!(next < u64::from(u32::MAX), SequenceExhaustedSnafu);
        Ok(next)
    }

    /// Records that a request/response pair consumed two sequence numbers.
    pub fn advance_sequence_number(&mut self) {
        let counter = self.secrets.as_mut().sequence_number_mut(self.id);
        *counter = counter.wrapping_add(SEQUENCE_NUMBER_STEP);
        log::debug!("VMPCK{} sequence counter advanced to {}", self.id.as_u8(), *counter);
    }

    /// Zeroes the key slot in the secrets page.
    pub fn wipe_key(&mut self) {
        self.secrets.as_mut().vmpck_mut(self.id).zeroize();
    }
}
