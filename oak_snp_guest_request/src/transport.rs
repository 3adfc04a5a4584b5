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

//! Moving encrypted guest messages through memory shared with the hypervisor.
//!
//! The host can modify shared memory at any time, so messages are copied in
//! and out of the shared buffers and nothing is interpreted in place.

use core::sync::atomic::{fence, Ordering};

use snafu::{ensure, Snafu};
use x86_64::{PhysAddr, VirtAddr};
use zerocopy::IntoBytes;

use crate::{guest::GuestMessage, Translator, PAGE_SIZE};

/// The exit code for a standard guest request.
///
/// See section 4.1.8 in <https://www.amd.com/content/dam/amd/en/documents/epyc-technical-docs/specifications/56421-guest-hypervisor-communication-block-standardization.pdf>.
pub const SW_EXIT_CODE_GUEST_REQUEST: u64 = 0x8000_0011;

/// The exit code for an extended guest request that also fetches the
/// certificate chain.
///
/// See section 4.1.8.2 in <https://www.amd.com/content/dam/amd/en/documents/epyc-technical-docs/specifications/56421-guest-hypervisor-communication-block-standardization.pdf>.
pub const SW_EXIT_CODE_EXT_GUEST_REQUEST: u64 = 0x8000_0012;

/// The hypervisor reports its own errors in the upper half of SW_EXITINFO2
/// and the firmware error in the lower half.
pub const VMM_ERROR_SHIFT: u32 = 32;

/// The certificate buffer is too small. The required number of pages is
/// returned in RBX.
pub const VMM_ERROR_INVALID_LEN: u64 = 1;

/// The hypervisor is throttling guest requests.
pub const VMM_ERROR_BUSY: u64 = 2;

/// How a round trip through the hypervisor ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportOutcome {
    /// The firmware produced a response.
    Success,
    /// The hypervisor did not forward the request; it may be retried with the
    /// same envelope.
    Busy,
    /// The certificate area is too small for the host's certificate chain.
    CertBufferTooSmall { required_pages: u64 },
    /// Any other failure reported in SW_EXITINFO2.
    HardError { exit_info_2: u64 },
}

impl TransportOutcome {
    /// Classifies the value of SW_EXITINFO2 after a guest request exit.
    ///
    /// Only the exact hypervisor error codes are recognized; any value with a
    /// firmware error in the lower half is a hard error.
    pub fn from_exit_info(exit_info: ExitInfo, extended: bool) -> Self {
        const BUSY: u64 = VMM_ERROR_BUSY << VMM_ERROR_SHIFT;
        const INVALID_LEN: u64 = VMM_ERROR_INVALID_LEN << VMM_ERROR_SHIFT;
        match exit_info.exit_info_2 {
            0 => TransportOutcome::Success,
            BUSY => TransportOutcome::Busy,
            INVALID_LEN if extended => {
                TransportOutcome::CertBufferTooSmall { required_pages: exit_info.cert_pages }
            }
            exit_info_2 => TransportOutcome::HardError { exit_info_2 },
        }
    }
}

#[derive(Debug, Snafu)]
pub enum TransportError {
    /// A shared buffer has no guest-physical address.
    #[snafu(display("couldn't translate the {buffer} buffer address"))]
    AddressTranslation { buffer: &'static str },
    /// The certificate buffer is not a whole number of pages or is larger than
    /// the shared certificate area.
    #[snafu(display("invalid certificate buffer length {len}"))]
    InvalidCertificateBuffer { len: usize },
    /// The exit to the hypervisor failed.
    #[snafu(display("guest request exit failed: {reason}"))]
    ExitFailed { reason: &'static str },
}

/// Moves one encrypted request to the firmware and its response back.
///
/// Implementations must not interpret the messages; the caller authenticates
/// whatever comes back.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    fn transmit(
        &mut self,
        request: &GuestMessage,
        response: &mut GuestMessage,
    ) -> Result<TransportOutcome, TransportError>;

    /// Like `transmit`, but also asks the host for its certificate chain.
    ///
    /// `certs` must be a whole number of pages; its length is the capacity
    /// offered to the host.
    fn transmit_extended(
        &mut self,
        request: &GuestMessage,
        response: &mut GuestMessage,
        certs: &mut [u8],
    ) -> Result<TransportOutcome, TransportError>;
}

/// The values the hypervisor hands back from a guest request exit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// The value of SW_EXITINFO2.
    pub exit_info_2: u64,
    /// The number of certificate pages, returned in RBX for extended requests.
    pub cert_pages: u64,
}

/// The privileged exit that hands a guest request to the hypervisor.
#[cfg_attr(test, mockall::automock)]
pub trait GuestRequestExit {
    /// Exits to the hypervisor with the given exit code.
    ///
    /// `certs` and `cert_pages` are only meaningful for extended requests.
    fn invoke(
        &mut self,
        exit_code: u64,
        request: PhysAddr,
        response: PhysAddr,
        certs: PhysAddr,
        cert_pages: u64,
    ) -> Result<ExitInfo, &'static str>;
}

/// A `Transport` over buffers that are already shared with the hypervisor.
pub struct SharedBufferTransport<E, T, M, C>
where
    E: GuestRequestExit,
    T: Translator,
    M: AsMut<GuestMessage> + AsRef<GuestMessage>,
    C: AsMut<[u8]> + AsRef<[u8]>,
{
    exit: E,
    translate: T,
    request: M,
    response: M,
    certs: C,
}

impl<E, T, M, C> SharedBufferTransport<E, T, M, C>
where
    E: GuestRequestExit,
    T: Translator,
    M: AsMut<GuestMessage> + AsRef<GuestMessage>,
    C: AsMut<[u8]> + AsRef<[u8]>,
{
    /// Wraps the shared buffers.
    ///
    /// The certificate area may be empty if extended requests are not used.
    pub fn new(
        exit: E,
        translate: T,
        request: M,
        response: M,
        certs: C,
    ) -> Result<Self, TransportError> {
        let len = certs.as_ref().len();
        ensure!(len % PAGE_SIZE == 0, InvalidCertificateBufferSnafu { len });
        Ok(Self { exit, translate, request, response, certs })
    }

    fn physical_address(
        &self,
        address: VirtAddr,
        buffer: &'static str,
    ) -> Result<PhysAddr, TransportError> {
        (self.translate)(address).ok_or(TransportError::AddressTranslation { buffer })
    }

    fn message_addresses(&self) -> Result<(PhysAddr, PhysAddr), TransportError> {
        let request = VirtAddr::from_ptr(self.request.as_ref() as *const GuestMessage);
        let response = VirtAddr::from_ptr(self.response.as_ref() as *const GuestMessage);
        Ok((
            self.physical_address(request, "request")?,
            self.physical_address(response, "response")?,
        ))
    }

    /// Copies the request into shared memory, exits, and copies the response
    /// back out.
    fn exchange(
        &mut self,
        exit_code: u64,
        request: &GuestMessage,
        response: &mut GuestMessage,
        certs: PhysAddr,
        cert_pages: u64,
    ) -> Result<ExitInfo, TransportError> {
        let (request_address, response_address) = self.message_addresses()?;

        self.request.as_mut().as_mut_bytes().copy_from_slice(request.as_bytes());
        self.response.as_mut().as_mut_bytes().fill(0);

        // Use a memory fence to ensure all writes to the shared buffers happen
        // before we hand over to the hypervisor.
        fence(Ordering::SeqCst);
        let exit_info = self
            .exit
            .invoke(exit_code, request_address, response_address, certs, cert_pages)
            .map_err(|reason| TransportError::ExitFailed { reason })?;
        // Use a memory fence to ensure that we don't read the response before the
        // exit returned.
        fence(Ordering::SeqCst);

        response.as_mut_bytes().copy_from_slice(self.response.as_ref().as_bytes());
        Ok(exit_info)
    }
}

impl<E, T, M, C> Transport for SharedBufferTransport<E, T, M, C>
where
    E: GuestRequestExit,
    T: Translator,
    M: AsMut<GuestMessage> + AsRef<GuestMessage>,
    C: AsMut<[u8]> + AsRef<[u8]>,
{
    fn transmit(
        &mut self,
        request: &GuestMessage,
        response: &mut GuestMessage,
    ) -> Result<TransportOutcome, TransportError> {
        let exit_info =
            self.exchange(SW_EXIT_CODE_GUEST_REQUEST, request, response, PhysAddr::zero(), 0)?;
        Ok(TransportOutcome::from_exit_info(exit_info, false))
    }

    fn transmit_extended(
        &mut self,
        request: &GuestMessage,
        response: &mut GuestMessage,
        certs: &mut [u8],
    ) -> Result<TransportOutcome, TransportError> {
        let len = certs.len();
        ensure!(
            len % PAGE_SIZE == 0 && len <= self.certs.as_ref().len(),
            InvalidCertificateBufferSnafu { len }
        );
        let certs_address = VirtAddr::from_ptr(self.certs.as_ref().as_ptr());
        let certs_address = self.physical_address(certs_address, "certificate")?;
        // Translate the message buffers as well before anything is written.
        self.message_addresses()?;

        self.certs.as_mut().fill(0);
        let exit_info = self.exchange(
            SW_EXIT_CODE_EXT_GUEST_REQUEST,
            request,
            response,
            certs_address,
            (len / PAGE_SIZE) as u64,
        )?;

        let outcome = TransportOutcome::from_exit_info(exit_info, true);
        if outcome == TransportOutcome::Success {
            certs.copy_from_slice(&self.certs.as_ref()[..len]);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::{boxed::Box, vec, vec::Vec};

    use googletest::prelude::*;
    use mockall::predicate::eq as equals;

    use super::*;

    fn identity(address: VirtAddr) -> Option<PhysAddr> {
        Some(PhysAddr::new(address.as_u64()))
    }

    fn request_with_payload(byte: u8) -> Box<GuestMessage> {
        let mut request = Box::new(GuestMessage::new());
        request.header.sequence_number = 11;
        request.payload.fill(byte);
        request
    }

    /// Fills in the guest message at `address`, as the firmware would.
    fn write_response(address: PhysAddr, sequence_number: u64, byte: u8) {
        // Safety: the tests use an identity translation, so the physical address is
        // the address of the shared response buffer, which lives for the whole test.
        let message = unsafe { &mut *(address.as_u64() as *mut GuestMessage) };
        message.header.sequence_number = sequence_number;
        message.payload.fill(byte);
    }

    #[googletest::test]
    fn test_classify_exit_info() {
        let info = |exit_info_2, cert_pages| ExitInfo { exit_info_2, cert_pages };
        assert_that!(
            TransportOutcome::from_exit_info(info(0, 0), false),
            eq(TransportOutcome::Success)
        );
        assert_that!(
            TransportOutcome::from_exit_info(info(VMM_ERROR_BUSY << 32, 0), false),
            eq(TransportOutcome::Busy)
        );
        assert_that!(
            TransportOutcome::from_exit_info(info(VMM_ERROR_INVALID_LEN << 32, 7), true),
            eq(TransportOutcome::CertBufferTooSmall { required_pages: 7 })
        );
        assert_that!(
            TransportOutcome::from_exit_info(info(VMM_ERROR_INVALID_LEN << 32, 7), false),
            eq(TransportOutcome::HardError { exit_info_2: 1 << 32 })
        );
        assert_that!(
            TransportOutcome::from_exit_info(info(0x16, 0), false),
            eq(TransportOutcome::HardError { exit_info_2: 0x16 })
        );
        assert_that!(
            TransportOutcome::from_exit_info(info((VMM_ERROR_BUSY << 32) | 0x16, 0), false),
            eq(TransportOutcome::HardError { exit_info_2: (2 << 32) | 0x16 })
        );
    }

    #[googletest::test]
    fn test_transmit_copies_in_and_out() {
        let mut exit = MockGuestRequestExit::new();
        exit.expect_invoke()
            .withf(|&code, request, _, &certs, &pages| {
                // Safety: see `write_response`.
                let shared = unsafe { &*(request.as_u64() as *const GuestMessage) };
                code == SW_EXIT_CODE_GUEST_REQUEST
                    && shared.header.sequence_number == 11
                    && shared.payload.iter().all(|&byte| byte == 5)
                    && certs.is_null()
                    && pages == 0
            })
            .times(1)
            .returning(|_, _, response, _, _| {
                write_response(response, 12, 9);
                Ok(ExitInfo::default())
            });
        let mut transport = SharedBufferTransport::new(
            exit,
            identity,
            Box::new(GuestMessage::new()),
            Box::new(GuestMessage::new()),
            Vec::new(),
        )
        .unwrap();

        let request = request_with_payload(5);
        let mut response = Box::new(GuestMessage::new());
        assert_that!(
            transport.transmit(&request, &mut response),
            ok(eq(&TransportOutcome::Success))
        );
        assert_that!(response.header.sequence_number, eq(12));
        assert!(response.payload.iter().all(|&byte| byte == 9));
    }

    #[googletest::test]
    fn test_untranslatable_buffer_is_not_written() {
        let mut exit = MockGuestRequestExit::new();
        exit.expect_invoke().never();
        let mut transport = SharedBufferTransport::new(
            exit,
            |_: VirtAddr| -> Option<PhysAddr> { None },
            Box::new(GuestMessage::new()),
            Box::new(GuestMessage::new()),
            Vec::new(),
        )
        .unwrap();

        let request = request_with_payload(5);
        let mut response = Box::new(GuestMessage::new());
        assert_that!(transport.transmit(&request, &mut response), err(anything()));
        assert!(transport.request.payload.iter().all(|&byte| byte == 0));
    }

    #[googletest::test]
    fn test_exit_failure_is_reported() {
        let mut exit = MockGuestRequestExit::new();
        exit.expect_invoke().times(1).returning(|_, _, _, _, _| Err("VMGEXIT failed"));
        let mut transport = SharedBufferTransport::new(
            exit,
            identity,
            Box::new(GuestMessage::new()),
            Box::new(GuestMessage::new()),
            Vec::new(),
        )
        .unwrap();

        let request = request_with_payload(5);
        let mut response = Box::new(GuestMessage::new());
        let result = transport.transmit(&request, &mut response);
        assert!(matches!(result, Err(TransportError::ExitFailed { .. })));
    }

    #[googletest::test]
    fn test_extended_request_copies_certificates() {
        let mut exit = MockGuestRequestExit::new();
        exit.expect_invoke()
            .with(
                equals(SW_EXIT_CODE_EXT_GUEST_REQUEST),
                mockall::predicate::always(),
                mockall::predicate::always(),
                mockall::predicate::always(),
                equals(2u64),
            )
            .times(1)
            .returning(|_, _, response, certs, _| {
                write_response(response, 12, 9);
                // Safety: see `write_response`.
                let certs = unsafe {
                    core::slice::from_raw_parts_mut(certs.as_u64() as *mut u8, 2 * PAGE_SIZE)
                };
                certs.fill(0xce);
                Ok(ExitInfo { exit_info_2: 0, cert_pages: 2 })
            });
        let mut transport = SharedBufferTransport::new(
            exit,
            identity,
            Box::new(GuestMessage::new()),
            Box::new(GuestMessage::new()),
            vec![0xffu8; 4 * PAGE_SIZE],
        )
        .unwrap();

        let request = request_with_payload(5);
        let mut response = Box::new(GuestMessage::new());
        let mut certs = vec![0u8; 2 * PAGE_SIZE];
        assert_that!(
            transport.transmit_extended(&request, &mut response, &mut certs),
            ok(eq(&TransportOutcome::Success))
        );
        assert!(certs.iter().all(|&byte| byte == 0xce));
        // The rest of the shared area was cleared before the exit.
        assert!(transport.certs[2 * PAGE_SIZE..].iter().all(|&byte| byte == 0));
    }

    #[googletest::test]
    fn test_extended_request_reports_required_pages() {
        let mut exit = MockGuestRequestExit::new();
        exit.expect_invoke()
            .times(1)
            .returning(|_, _, _, _, _| Ok(ExitInfo { exit_info_2: 1 << 32, cert_pages: 7 }));
        let mut transport = SharedBufferTransport::new(
            exit,
            identity,
            Box::new(GuestMessage::new()),
            Box::new(GuestMessage::new()),
            vec![0u8; 8 * PAGE_SIZE],
        )
        .unwrap();

        let request = request_with_payload(5);
        let mut response = Box::new(GuestMessage::new());
        let mut certs = vec![0u8; PAGE_SIZE];
        assert_that!(
            transport.transmit_extended(&request, &mut response, &mut certs),
            ok(eq(&TransportOutcome::CertBufferTooSmall { required_pages: 7 }))
        );
        assert!(certs.iter().all(|&byte| byte == 0));
    }

    #[googletest::test]
    fn test_extended_request_rejects_bad_certificate_buffers() {
        let mut exit = MockGuestRequestExit::new();
        exit.expect_invoke().never();
        let mut transport = SharedBufferTransport::new(
            exit,
            identity,
            Box::new(GuestMessage::new()),
            Box::new(GuestMessage::new()),
            vec![0u8; PAGE_SIZE],
        )
        .unwrap();

        let request = request_with_payload(5);
        let mut response = Box::new(GuestMessage::new());
        let mut unaligned = vec![0u8; 100];
        let mut too_large = vec![0u8; 2 * PAGE_SIZE];
        assert_that!(
            transport.transmit_extended(&request, &mut response, &mut unaligned),
            err(anything())
        );
        assert_that!(
            transport.transmit_extended(&request, &mut response, &mut too_large),
            err(anything())
        );
        assert_that!(
            SharedBufferTransport::new(
                MockGuestRequestExit::new(),
                identity,
                Box::new(GuestMessage::new()),
                Box::new(GuestMessage::new()),
                vec![0u8; 10],
            )
            .map(|_| ()),
            err(anything())
        );
    }
}
