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

//! Wire layout of guest request envelopes and of the request payloads sent in
//! them.
//!
//! All layouts follow section 8.26 of
//! <https://www.amd.com/system/files/TechDocs/56860.pdf>.

use bitflags::bitflags;
use core::mem::size_of;
use strum::{EnumIter, FromRepr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::crypto::AUTH_TAG_SIZE;

/// Size of a whole envelope. Each envelope fills exactly one page.
pub const GUEST_MESSAGE_SIZE: usize = 4096;

/// Room left for the payload after the 96 byte header.
pub const MAX_PAYLOAD_SIZE: usize = GUEST_MESSAGE_SIZE - size_of::<GuestMessageHeader>();

pub const CURRENT_HEADER_VERSION: u8 = 1;

pub const CURRENT_MESSAGE_VERSION: u8 = 1;

const AUTH_TAG_FIELD_SIZE: usize = 32;

/// A page-sized envelope. Requests and responses share this layout.
#[repr(C, align(4096))]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GuestMessage {
    pub header: GuestMessageHeader,
    /// Ciphertext. Only the first `message_size` bytes are meaningful.
    pub payload: [u8; MAX_PAYLOAD_SIZE],
}

static_assertions::assert_eq_size!(GuestMessage, [u8; GUEST_MESSAGE_SIZE]);

impl GuestMessage {
    pub const fn new() -> Self {
        Self { header: GuestMessageHeader::new(), payload: [0; MAX_PAYLOAD_SIZE] }
    }
}

impl Default for GuestMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl AsMut<GuestMessage> for GuestMessage {
    #[inline]
    fn as_mut(&mut self) -> &mut GuestMessage {
        self
    }
}

impl AsRef<GuestMessage> for GuestMessage {
    #[inline]
    fn as_ref(&self) -> &GuestMessage {
        self
    }
}

/// Bytes 0x30..0x60 of the header. They are covered by the tag as AEAD
/// associated data but are sent in the clear.
#[repr(C)]
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AuthenticatedHeader {
    /// Raw `AeadAlgorithm` value.
    pub algorithm: u8,
    pub header_version: u8,
    pub header_size: u16,
    /// Raw `MessageType` value.
    pub message_type: u8,
    pub message_version: u8,
    /// Number of ciphertext bytes in the payload.
    pub message_size: u16,
    _reserved_1: u32,
    /// Index of the key slot that protects the payload.
    pub message_vmpck: u8,
    _reserved_2: [u8; 35],
}

static_assertions::assert_eq_size!(AuthenticatedHeader, [u8; 48]);

/// Envelope header.
///
/// The sequence number doubles as the AES-GCM nonce, so a value must never be
/// sent twice under one key.
#[repr(C)]
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GuestMessageHeader {
    /// AES-GCM uses the leading 16 bytes. The rest stays zero.
    pub auth_tag: [u8; AUTH_TAG_FIELD_SIZE],
    pub sequence_number: u64,
    _reserved_0: u64,
    pub auth_header: AuthenticatedHeader,
}

static_assertions::assert_eq_size!(GuestMessageHeader, [u8; 96]);

impl GuestMessageHeader {
    pub const fn new() -> Self {
        Self {
            auth_tag: [0; AUTH_TAG_FIELD_SIZE],
            sequence_number: 0,
            _reserved_0: 0,
            auth_header: AuthenticatedHeader {
                algorithm: AeadAlgorithm::Aes256Gcm as u8,
                header_version: CURRENT_HEADER_VERSION,
                header_size: size_of::<GuestMessageHeader>() as u16,
                message_type: MessageType::Invalid as u8,
                message_version: CURRENT_MESSAGE_VERSION,
                message_size: 0,
                _reserved_1: 0,
                message_vmpck: 0,
                _reserved_2: [0; 35],
            },
        }
    }

    pub fn get_algorithm(&self) -> Option<AeadAlgorithm> {
        AeadAlgorithm::from_repr(self.auth_header.algorithm)
    }

    pub fn get_message_type(&self) -> Option<MessageType> {
        MessageType::from_repr(self.auth_header.message_type)
    }

    pub fn tag(&self) -> [u8; AUTH_TAG_SIZE] {
        let mut tag = [0u8; AUTH_TAG_SIZE];
        tag.copy_from_slice(&self.auth_tag[..AUTH_TAG_SIZE]);
        tag
    }

    /// Stores `tag` and clears the unused tail of the tag field.
    pub fn set_tag(&mut self, tag: &[u8; AUTH_TAG_SIZE]) {
        let (used, unused) = self.auth_tag.split_at_mut(AUTH_TAG_SIZE);
        used.copy_from_slice(tag);
        unused.fill(0);
    }

    /// Checks that a response header describes something we can decrypt.
    ///
    /// Reserved bytes are ignored since firmware does not always zero them.
    /// Type, version and key slot are matched against the request by the
    /// caller.
    pub fn validate(&self) -> Result<(), &'static str> {
        let header = &self.auth_header;
        match self.get_algorithm() {
            Some(AeadAlgorithm::Aes256Gcm) => {}
            _ => return Err("unsupported algorithm"),
        }
        if header.header_version != CURRENT_HEADER_VERSION {
            return Err("unsupported header version");
        }
        if usize::from(header.header_size) != size_of::<Self>() {
            return Err("unexpected header size");
        }
        if usize::from(header.message_size) > MAX_PAYLOAD_SIZE {
            return Err("payload does not fit in the envelope");
        }
        Ok(())
    }
}

impl Default for GuestMessageHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, FromRepr, PartialEq)]
#[repr(u8)]
pub enum AeadAlgorithm {
    Invalid = 0,
    Aes256Gcm = 1,
}

/// Payload type codes. A response code is always its request code plus one.
#[derive(Clone, Copy, Debug, FromRepr, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Invalid = 0,
    CpuidRequest = 1,
    CpuidResponse = 2,
    KeyRequest = 3,
    KeyResponse = 4,
    ReportRequest = 5,
    ReportResponse = 6,
    ExportRequest = 7,
    ExportResponse = 8,
    ImportRequest = 9,
    ImportResponse = 10,
    AbsorbRequest = 11,
    AbsorbResponse = 12,
    VmrkRequest = 13,
    VmrkResponse = 14,
    AbsorbNomaRequest = 15,
    AbsorbNomaResponse = 16,
    TscInfoRequest = 17,
    TscInfoResponse = 18,
}

impl MessageType {
    pub fn response_type(self) -> Option<MessageType> {
        MessageType::from_repr((self as u8).checked_add(1)?)
    }
}

/// A request payload with a fixed wire layout.
pub trait Message: IntoBytes + Immutable {
    fn get_message_type() -> MessageType;
}

/// Root of the derivation chain, held in bit 0 of `key_select`.
#[derive(Clone, Copy, Debug, Default, EnumIter, FromRepr, PartialEq)]
#[repr(u32)]
pub enum RootKey {
    #[default]
    Vcek = 0,
    /// Root key handed over by a migration agent.
    Vmrk = 1,
}

/// Endorsement key that seeds the derivation, held in bits 1-2 of
/// `key_select`.
#[derive(Clone, Copy, Debug, Default, EnumIter, FromRepr, PartialEq)]
#[repr(u32)]
pub enum DerivationKey {
    /// VLEK when one is loaded, else VCEK.
    #[default]
    Default = 0,
    Vcek = 1,
    Vlek = 2,
    Reserved = 3,
}

bitflags! {
    /// Launch properties of the guest that can be bound into a derived key.
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct GuestFieldFlags: u64 {
        const GUEST_POLICY = 1 << 0;
        const IMAGE_ID = 1 << 1;
        const FAMILY_ID = 1 << 2;
        const MEASUREMENT = 1 << 3;
        const GUEST_SVN = 1 << 4;
        const TCB_VERSION = 1 << 5;
    }
}

/// Payload of a `KeyRequest` message.
///
/// ```
/// use oak_snp_guest_request::guest::{DerivationKey, GuestFieldFlags, KeyRequest};
///
/// let request = KeyRequest::new()
///     .with_derivation_key(DerivationKey::Vcek)
///     .with_guest_fields(GuestFieldFlags::MEASUREMENT | GuestFieldFlags::GUEST_POLICY);
/// assert_eq!(request.derivation_key(), DerivationKey::Vcek);
/// ```
#[repr(C)]
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct KeyRequest {
    key_select: u32,
    _reserved: u32,
    /// Raw `GuestFieldFlags` bits.
    pub guest_field_select: u64,
    /// Must not be lower than the VMPL the guest runs at.
    pub vmpl: u32,
    pub guest_svn: u32,
    pub tcb_version: u64,
}

static_assertions::assert_eq_size!(KeyRequest, [u8; 32]);

impl KeyRequest {
    const ROOT_KEY_BITS: u32 = 0b001;
    const DERIVATION_KEY_BITS: u32 = 0b110;

    pub const fn new() -> Self {
        Self {
            key_select: 0,
            _reserved: 0,
            guest_field_select: 0,
            vmpl: 0,
            guest_svn: 0,
            tcb_version: 0,
        }
    }

    pub fn with_root_key(mut self, root: RootKey) -> Self {
        self.key_select = (self.key_select & !Self::ROOT_KEY_BITS) | root as u32;
        self
    }

    pub fn with_derivation_key(mut self, key: DerivationKey) -> Self {
        self.key_select = (self.key_select & !Self::DERIVATION_KEY_BITS) | ((key as u32) << 1);
        self
    }

    pub fn with_guest_fields(mut self, fields: GuestFieldFlags) -> Self {
        self.guest_field_select = fields.bits();
        self
    }

    pub fn with_vmpl(mut self, vmpl: u32) -> Self {
        self.vmpl = vmpl;
        self
    }

    pub fn root_key(&self) -> RootKey {
        if self.key_select & Self::ROOT_KEY_BITS == 0 {
            RootKey::Vcek
        } else {
            RootKey::Vmrk
        }
    }

    pub fn derivation_key(&self) -> DerivationKey {
        match (self.key_select & Self::DERIVATION_KEY_BITS) >> 1 {
            0 => DerivationKey::Default,
            1 => DerivationKey::Vcek,
            2 => DerivationKey::Vlek,
            _ => DerivationKey::Reserved,
        }
    }

    /// `None` if unknown bits are set.
    pub fn guest_fields(&self) -> Option<GuestFieldFlags> {
        GuestFieldFlags::from_bits(self.guest_field_select)
    }
}

impl Default for KeyRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl Message for KeyRequest {
    fn get_message_type() -> MessageType {
        MessageType::KeyRequest
    }
}

/// Payload of a `ReportRequest` message.
#[repr(C)]
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ReportRequest {
    /// Caller data echoed into the signed report, typically a nonce or a hash
    /// of a public key.
    pub report_data: [u8; 64],
    /// Must not be lower than the VMPL the guest runs at.
    pub vmpl: u32,
    _reserved: [u8; 28],
}

static_assertions::assert_eq_size!(ReportRequest, [u8; 96]);

impl ReportRequest {
    pub const fn new(report_data: [u8; 64]) -> Self {
        Self { report_data, vmpl: 0, _reserved: [0; 28] }
    }
}

impl Message for ReportRequest {
    fn get_message_type() -> MessageType {
        MessageType::ReportRequest
    }
}
