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

//! Layout of the secrets page that the platform provisions into guest memory
//! during SEV-SNP launch.
//!
//! The page holds the four VM platform communication keys and, in the area
//! reserved for the guest OS, the message sequence counter that belongs to
//! each of them.

use strum::{EnumIter, FromRepr};
use zerocopy::FromBytes;

pub const SECRETS_PAGE_SIZE: usize = 4096;

/// Secrets pages older than this don't carry the VMPCKs.
pub const SECRETS_PAGE_MIN_VERSION: u32 = 2;

/// The size of a VM platform communication key.
pub const VMPCK_SIZE: usize = 32;

/// Identifies one of the four VM platform communication key slots.
#[derive(Clone, Copy, Debug, Default, EnumIter, FromRepr, PartialEq, Eq)]
#[repr(u8)]
pub enum VmpckId {
    #[default]
    Vmpck0 = 0,
    Vmpck1 = 1,
    Vmpck2 = 2,
    Vmpck3 = 3,
}

impl VmpckId {
    /// The value used for the `message_vmpck` field of a message header.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u32> for VmpckId {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        u8::try_from(value).ok().and_then(VmpckId::from_repr).ok_or("invalid VMPCK id")
    }
}

/// The part of the secrets page that the guest OS owns.
///
/// Only the sequence counters are used here. The rest is kept so the layout
/// matches the page.
///
/// See Table 4 in <https://www.amd.com/content/dam/amd/en/documents/epyc-technical-docs/specifications/56421-guest-hypervisor-communication-block-standardization.pdf>
#[repr(C)]
#[derive(FromBytes)]
pub struct OsArea {
    /// Sequence counter of the last message exchanged with each VMPCK.
    pub msg_seqno: [u32; 4],
    pub ap_jump_table_pa: u64,
    _reserved: [u8; 40],
    pub guest_usage: [u8; 32],
}

static_assertions::assert_eq_size!(OsArea, [u8; 96]);

/// The secrets page, with the fields that come after the OS area folded into
/// `_tail`.
///
/// See Table 71 in <https://www.amd.com/system/files/TechDocs/56860.pdf>
#[repr(C, align(4096))]
#[derive(FromBytes)]
pub struct SecretsPage {
    pub version: u32,
    /// Bit 0 is set if the guest was launched from an initial migration
    /// image. No other bits may be set.
    pub imi_en: u32,
    pub fms: u32,
    _reserved: u32,
    pub gosv: [u8; 16],
    /// The VM platform communication keys, indexed by `VmpckId`.
    pub vmpck: [[u8; VMPCK_SIZE]; 4],
    pub os_area: OsArea,
    _tail: [u8; 0xf00],
}

static_assertions::assert_eq_size!(SecretsPage, [u8; SECRETS_PAGE_SIZE]);
static_assertions::const_assert_eq!(core::mem::offset_of!(SecretsPage, vmpck), 0x20);
static_assertions::const_assert_eq!(core::mem::offset_of!(SecretsPage, os_area), 0xa0);

impl SecretsPage {
    /// Rejects pages that are too old to hold keys or that have an
    /// unexpected value in `imi_en`.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.version < SECRETS_PAGE_MIN_VERSION {
            return Err("secrets page version too old");
        }
        if self.imi_en > 1 {
            return Err("unexpected imi_en value");
        }
        Ok(())
    }

    pub fn vmpck(&self, id: VmpckId) -> &[u8; VMPCK_SIZE] {
        &self.vmpck[id.index()]
    }

    pub fn vmpck_mut(&mut self, id: VmpckId) -> &mut [u8; VMPCK_SIZE] {
        &mut self.vmpck[id.index()]
    }

    pub fn sequence_number(&self, id: VmpckId) -> u32 {
        self.os_area.msg_seqno[id.index()]
    }

    pub fn sequence_number_mut(&mut self, id: VmpckId) -> &mut u32 {
        &mut self.os_area.msg_seqno[id.index()]
    }
}

impl AsMut<SecretsPage> for SecretsPage {
    #[inline]
    fn as_mut(&mut self) -> &mut SecretsPage {
        self
    }
}

impl AsRef<SecretsPage> for SecretsPage {
    #[inline]
    fn as_ref(&self) -> &SecretsPage {
        self
    }
}
