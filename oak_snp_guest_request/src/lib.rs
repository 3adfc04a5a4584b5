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

//! Guest side of the SEV-SNP guest request protocol.
//!
//! The guest talks to the Platform Security Processor (PSP) through messages
//! that are encrypted with one of the VM platform communication keys (VMPCKs)
//! provisioned in the secrets page. The host relays these messages, so
//! everything it hands back is treated as untrusted: responses are bound to
//! their requests, authenticated, and any anomaly permanently disables the
//! key.
//!
//! See section 7 of <https://www.amd.com/system/files/TechDocs/56860.pdf> and
//! section 4.1.8 of <https://www.amd.com/system/files/TechDocs/56421-guest-hypervisor-communication-block-standardization.pdf>.

#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod clock;
pub mod config;
pub mod crypto;
pub mod guest;
pub mod keys;
pub mod message;
pub mod retry;
pub mod secrets;
pub mod session;
pub mod transport;

pub use crate::{
    config::{SessionConfig, SessionConfigBuilder},
    session::{DerivedKey, ExtendedReport, ReportResponse, Session, SessionError},
};

use x86_64::{PhysAddr, VirtAddr};

/// The size of a small page, which is the granularity of shared memory.
pub const PAGE_SIZE: usize = 4096;

/// Translates a guest-virtual address to a guest-physical address.
///
/// Returns `None` if the address is not mapped.
pub trait Translator: Fn(VirtAddr) -> Option<PhysAddr> {}

impl<X: Fn(VirtAddr) -> Option<PhysAddr>> Translator for X {}
