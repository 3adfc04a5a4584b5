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

//! A guest request session bound to one VM platform communication key.
//!
//! All requests of a session are serialized by a single lock that is held from
//! building the request until the response has been opened, including any
//! waiting while the host is busy. Anything that suggests the host or the
//! firmware misbehaved disables the session for good and wipes the key.

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use snafu::{ensure, ResultExt, Snafu};
use spinning_top::Spinlock;
use zerocopy::IntoBytes;
use zeroize::{Zeroize, Zeroizing};

use crate::{
    clock::Clock,
    config::SessionConfig,
    guest::{GuestMessage, KeyRequest, Message, ReportRequest, MAX_PAYLOAD_SIZE},
    keys::{KeyStore, KeyStoreError, Vmpck},
    message::{build_request, parse_response, EnvelopeError},
    retry::{Completion, Event, RequestKind, RequestState, RetryPolicy},
    secrets::{SecretsPage, VmpckId},
    transport::{Transport, TransportError, VMM_ERROR_INVALID_LEN, VMM_ERROR_SHIFT},
    PAGE_SIZE,
};

/// The size of the derived key response payload.
pub const DERIVED_KEY_RESPONSE_SIZE: usize = 64;

#[derive(Debug, Snafu)]
pub enum SessionError {
    /// The session was disabled by an earlier failure.
    #[snafu(display("guest request session is disabled"))]
    SessionDisabled,
    /// The certificate buffer is not a whole number of pages or is too large.
    #[snafu(display("invalid certificate buffer length {len}"))]
    InvalidCertificateBuffer { len: usize },
    /// The request could not be built. The session is still usable.
    #[snafu(display("couldn't build guest request"))]
    Envelope { source: EnvelopeError },
    /// The request could not be handed to the hypervisor.
    #[snafu(display("guest request transport failed"))]
    Transport { source: TransportError },
    /// The host stayed busy for too long.
    #[snafu(display("timed out waiting for the host to accept the guest request"))]
    Timeout,
    /// The host or the firmware reported an error.
    #[snafu(display(
        "guest request failed with VMM error {vmm_error:#x}, firmware error {firmware_error:#x}"
    ))]
    Firmware { vmm_error: u32, firmware_error: u32 },
    /// The response was not a valid answer to the request.
    #[snafu(display("invalid guest request response"))]
    Protocol { source: EnvelopeError },
    /// The key could not be used.
    #[snafu(display("invalid guest request key"))]
    KeyStore { source: KeyStoreError },
}

/// The latch that permanently disables a session.
#[derive(Debug)]
pub struct SessionGuard {
    active: AtomicBool,
}

impl SessionGuard {
    fn new() -> Self {
        Self { active: AtomicBool::new(true) }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), SessionError> {
        ensure!(self.is_active(), SessionDisabledSnafu);
        Ok(())
    }

    /// Latches the guard. Returns whether this call disabled it.
    fn disable(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }
}

/// An attestation report response payload, as returned by the firmware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportResponse {
    pub data: Vec<u8>,
}

/// A key derived by the firmware. Zeroed when dropped.
pub struct DerivedKey(Zeroizing<[u8; DERIVED_KEY_RESPONSE_SIZE]>);

impl DerivedKey {
    /// The key derivation response payload.
    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_RESPONSE_SIZE] {
        &self.0
    }
}

impl core::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

/// The result of an extended report request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtendedReport {
    /// The report, with the host's certificates in the caller's buffer.
    Report { report: ReportResponse, certs_len: usize },
    /// The certificate buffer was too small. The request may be repeated with
    /// a buffer of at least `required_len` bytes.
    CertBufferTooSmall { required_len: u64 },
}

enum Reply<R> {
    Response(R),
    CertBufferTooSmall { required_pages: u64 },
}

struct Inner<S: AsMut<SecretsPage> + AsRef<SecretsPage>, T: Transport> {
    keys: KeyStore<S>,
    key: Vmpck,
    transport: T,
    /// Private copy of the last request.
    request: Box<GuestMessage>,
    /// Private copy of the last response.
    response: Box<GuestMessage>,
}

impl<S: AsMut<SecretsPage> + AsRef<SecretsPage>, T: Transport> Inner<S, T> {
    fn clear_payloads(&mut self) {
        self.request.payload.zeroize();
        self.response.payload.zeroize();
    }
}

/// The guest side of the guest request protocol for one key.
pub struct Session<S, T, C>
where
    S: AsMut<SecretsPage> + AsRef<SecretsPage>,
    T: Transport,
    C: Clock,
{
    config: SessionConfig,
    policy: RetryPolicy,
    guard: SessionGuard,
    clock: C,
    inner: Spinlock<Inner<S, T>>,
}

impl<S, T, C> Session<S, T, C>
where
    S: AsMut<SecretsPage> + AsRef<SecretsPage>,
    T: Transport,
    C: Clock,
{
    /// Creates a session for the key selected in `config`.
    ///
    /// Fails if the secrets page is invalid or the key is not provisioned.
    pub fn new(
        config: SessionConfig,
        secrets: S,
        transport: T,
        clock: C,
    ) -> Result<Self, SessionError> {
        let keys = KeyStore::new(secrets, config.vmpck_id).context(KeyStoreSnafu)?;
        let key = keys.key();
        Ok(Self {
            policy: config.retry_policy(),
            config,
            guard: SessionGuard::new(),
            clock,
            inner: Spinlock::new(Inner {
                keys,
                key,
                transport,
                request: Box::new(GuestMessage::new()),
                response: Box::new(GuestMessage::new()),
            }),
        })
    }

    pub fn vmpck_id(&self) -> VmpckId {
        self.config.vmpck_id
    }

    pub fn is_active(&self) -> bool {
        self.guard.is_active()
    }

    /// The current value of the key's sequence counter.
    pub fn sequence_number(&self) -> u32 {
        self.inner.lock().keys.sequence_number()
    }

    /// Requests an attestation report.
    pub fn get_report(&self, request: &ReportRequest) -> Result<ReportResponse, SessionError> {
        match self.request(request, None, MAX_PAYLOAD_SIZE, |payload| payload.to_vec())? {
            Reply::Response(data) => Ok(ReportResponse { data }),
            Reply::CertBufferTooSmall { .. } => Err(standard_request_negotiated()),
        }
    }

    /// Requests a key derived by the firmware.
    pub fn get_derived_key(&self, request: &KeyRequest) -> Result<DerivedKey, SessionError> {
        let reply = self.request(request, None, DERIVED_KEY_RESPONSE_SIZE, |payload| {
            let mut key = Zeroizing::new([0u8; DERIVED_KEY_RESPONSE_SIZE]);
            key[..payload.len()].copy_from_slice(payload);
            DerivedKey(key)
        })?;
        match reply {
            Reply::Response(key) => Ok(key),
            Reply::CertBufferTooSmall { .. } => Err(standard_request_negotiated()),
        }
    }

    /// Requests an attestation report together with the host's certificates.
    ///
    /// `certs` must be a whole number of pages. An empty buffer requests just
    /// the report. If the buffer is too small the required length is returned
    /// and the session stays usable.
    pub fn get_extended_report(
        &self,
        request: &ReportRequest,
        certs: &mut [u8],
    ) -> Result<ExtendedReport, SessionError> {
        self.guard.check()?;
        if certs.is_empty() {
            let report = self.get_report(request)?;
            return Ok(ExtendedReport::Report { report, certs_len: 0 });
        }
        let len = certs.len();
        ensure!(
            len % PAGE_SIZE == 0 && len <= self.config.max_certificate_len,
            InvalidCertificateBufferSnafu { len }
        );

        let reply =
            self.request(request, Some(&mut *certs), MAX_PAYLOAD_SIZE, |payload| payload.to_vec())?;
        match reply {
            Reply::Response(data) => {
                if certs.iter().all(|&byte| byte == 0) {
                    log::warn!("the host did not provide any certificates");
                }
                Ok(ExtendedReport::Report { report: ReportResponse { data }, certs_len: len })
            }
            Reply::CertBufferTooSmall { required_pages } => {
                Ok(ExtendedReport::CertBufferTooSmall {
                    required_len: required_pages.saturating_mul(PAGE_SIZE as u64),
                })
            }
        }
    }

    /// Sends `message` and passes the decrypted response payload to `read`.
    ///
    /// The private copies of the request and response payloads are cleared
    /// before returning, whatever the outcome.
    fn request<M: Message, R>(
        &self,
        message: &M,
        certs: Option<&mut [u8]>,
        capacity: usize,
        read: impl FnOnce(&[u8]) -> R,
    ) -> Result<Reply<R>, SessionError> {
        self.guard.check()?;
        let mut inner = self.inner.lock();
        // Another caller may have disabled the session while we waited.
        self.guard.check()?;
        let inner = &mut *inner;

        let result = self.exchange(inner, message, certs, capacity, read);
        inner.clear_payloads();
        result
    }

    fn exchange<M: Message, R>(
        &self,
        inner: &mut Inner<S, T>,
        message: &M,
        certs: Option<&mut [u8]>,
        capacity: usize,
        read: impl FnOnce(&[u8]) -> R,
    ) -> Result<Reply<R>, SessionError> {
        build_request(
            &inner.keys,
            &inner.key,
            M::get_message_type(),
            self.config.message_version,
            message.as_bytes(),
            &mut inner.request,
        )
        .context(EnvelopeSnafu)?;

        let kind = if certs.is_some() { RequestKind::Extended } else { RequestKind::Standard };
        if let Some(required_pages) = self.handle_request(inner, kind, certs)? {
            // The response to the downgraded request is not used.
            return Ok(Reply::CertBufferTooSmall { required_pages });
        }

        let parsed =
            parse_response(&inner.key, &inner.request.header, &mut inner.response, capacity)
                .map(read);
        match parsed {
            Ok(response) => Ok(Reply::Response(response)),
            Err(source) => Err(self.disable(inner, SessionError::Protocol { source })),
        }
    }

    /// Runs the request in `inner` through the retry state machine.
    ///
    /// Once the envelope has been exposed to the host the sequence number is
    /// advanced exactly once, whatever the outcome. Returns the number of
    /// certificate pages the host asked for if the request was downgraded.
    fn handle_request(
        &self,
        inner: &mut Inner<S, T>,
        kind: RequestKind,
        mut certs: Option<&mut [u8]>,
    ) -> Result<Option<u64>, SessionError> {
        let start = self.clock.now();
        let mut state = RequestState::initial(kind);
        let mut exposed = false;

        loop {
            let elapsed = self.clock.now().saturating_sub(start);
            state = match state {
                RequestState::Issue { kind, .. } => {
                    let result = match (kind, certs.as_deref_mut()) {
                        (RequestKind::Extended, Some(certs)) => inner.transport.transmit_extended(
                            &inner.request,
                            &mut inner.response,
                            certs,
                        ),
                        _ => inner.transport.transmit(&inner.request, &mut inner.response),
                    };
                    match result {
                        Ok(outcome) => {
                            exposed = true;
                            self.policy.transition(state, Event::Transmitted(outcome), elapsed)
                        }
                        Err(source) => {
                            if !exposed && !matches!(source, TransportError::ExitFailed { .. }) {
                                return Err(SessionError::Transport { source });
                            }
                            inner.keys.advance_sequence_number();
                            return Err(self.disable(inner, SessionError::Transport { source }));
                        }
                    }
                }
                RequestState::Backoff { .. } => {
                    log::warn!(
                        "host busy, retrying guest request in {:?}",
                        self.policy.retry_delay
                    );
                    self.clock.sleep(self.policy.retry_delay);
                    let elapsed = self.clock.now().saturating_sub(start);
                    self.policy.transition(state, Event::Resumed, elapsed)
                }
                RequestState::DowngradeAndReissue { required_pages } => {
                    log::debug!(
                        "certificate buffer too small, {} pages required, reissuing without it",
                        required_pages
                    );
                    self.policy.transition(state, Event::Resumed, elapsed)
                }
                RequestState::Finalize(completion) => {
                    inner.keys.advance_sequence_number();
                    return match completion {
                        Completion::Success => Ok(None),
                        Completion::CertBufferTooSmall { required_pages } => {
                            Ok(Some(required_pages))
                        }
                        Completion::Timeout => Err(self.disable(inner, SessionError::Timeout)),
                        Completion::FirmwareError { exit_info_2 } => Err(self.disable(
                            inner,
                            SessionError::Firmware {
                                vmm_error: (exit_info_2 >> VMM_ERROR_SHIFT) as u32,
                                firmware_error: exit_info_2 as u32,
                            },
                        )),
                    };
                }
            };
        }
    }

    /// Permanently disables the session and wipes the key, both the session's
    /// copy and the slot in the secrets page.
    fn disable(&self, inner: &mut Inner<S, T>, error: SessionError) -> SessionError {
        if self.guard.disable() {
            log::error!(
                "disabling VMPCK{} after guest request failure: {}",
                self.config.vmpck_id.as_u8(),
                error
            );
        }
        inner.key.wipe();
        inner.keys.wipe_key();
        error
    }
}

/// Standard requests never negotiate certificates, so the state machine reports
/// the host's answer as a firmware error before it can get here.
fn standard_request_negotiated() -> SessionError {
    SessionError::Firmware { vmm_error: VMM_ERROR_INVALID_LEN as u32, firmware_error: 0 }
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;

    use googletest::prelude::*;
    use zerocopy::FromZeros;

    use super::*;
    use crate::{
        clock::SimulatedClock,
        guest::MessageType,
        message::encode,
        secrets::VMPCK_SIZE,
        transport::{MockTransport, TransportOutcome},
    };

    const KEY: [u8; VMPCK_SIZE] = [0x42; VMPCK_SIZE];

    fn secrets(sequence_number: u32) -> Box<SecretsPage> {
        let mut page = Box::new(SecretsPage::new_zeroed());
        page.version = 3;
        *page.vmpck_mut(VmpckId::Vmpck0) = KEY;
        *page.sequence_number_mut(VmpckId::Vmpck0) = sequence_number;
        page
    }

    fn session(
        sequence_number: u32,
        transport: MockTransport,
    ) -> Session<Box<SecretsPage>, MockTransport, SimulatedClock> {
        Session::new(
            SessionConfig::default(),
            secrets(sequence_number),
            transport,
            SimulatedClock::new(),
        )
        .unwrap()
    }

    /// Answers `request` the way the firmware would, with `plaintext` as the
    /// response payload.
    fn answer(request: &GuestMessage, response: &mut GuestMessage, plaintext: &[u8]) {
        let request_type = request.header.get_message_type().unwrap();
        encode(
            VmpckId::Vmpck0,
            &Vmpck::new(KEY),
            request.header.sequence_number + 1,
            request_type.response_type().unwrap(),
            request.header.auth_header.message_version,
            plaintext,
            response,
        )
        .unwrap();
    }

    fn key_request_transport(plaintext: [u8; DERIVED_KEY_RESPONSE_SIZE]) -> MockTransport {
        let mut transport = MockTransport::new();
        transport
            .expect_transmit()
            .withf(|request, _| {
                request.header.get_message_type() == Some(MessageType::KeyRequest)
                    && request.header.auth_header.message_size == 32
            })
            .times(1)
            .returning(move |request, response| {
                answer(request, response, &plaintext);
                Ok(TransportOutcome::Success)
            });
        transport
    }

    #[googletest::test]
    fn test_derived_key_is_copied_and_buffers_cleared() {
        let session = session(10, key_request_transport([0xd7; DERIVED_KEY_RESPONSE_SIZE]));

        let key = session.get_derived_key(&KeyRequest::new()).unwrap();

        assert_eq!(key.as_bytes(), &[0xd7; DERIVED_KEY_RESPONSE_SIZE]);
        assert_that!(session.sequence_number(), eq(12));
        let inner = session.inner.lock();
        assert!(inner.response.payload.iter().all(|&byte| byte == 0));
        assert!(inner.request.payload.iter().all(|&byte| byte == 0));
    }

    #[googletest::test]
    fn test_derived_key_buffers_cleared_on_failure() {
        let mut transport = MockTransport::new();
        transport.expect_transmit().times(1).returning(|request, response| {
            answer(request, response, &[0xd7; DERIVED_KEY_RESPONSE_SIZE]);
            response.payload[0] ^= 0xff;
            Ok(TransportOutcome::Success)
        });
        let session = session(10, transport);

        let result = session.get_derived_key(&KeyRequest::new());

        assert!(matches!(result, Err(SessionError::Protocol { .. })));
        assert_that!(session.is_active(), eq(false));
        let inner = session.inner.lock();
        assert!(inner.response.payload.iter().all(|&byte| byte == 0));
        assert_that!(inner.key.is_wiped(), eq(true));
        assert_that!(inner.keys.is_empty(), eq(true));
        assert_that!(inner.keys.sequence_number(), eq(12));
    }

    #[googletest::test]
    fn test_local_transport_error_keeps_session_usable() {
        let mut transport = MockTransport::new();
        transport
            .expect_transmit()
            .times(1)
            .returning(|_, _| Err(TransportError::AddressTranslation { buffer: "request" }));
        let session = session(10, transport);

        let result = session.get_report(&ReportRequest::new([0; 64]));

        assert!(matches!(result, Err(SessionError::Transport { .. })));
        assert_that!(session.is_active(), eq(true));
        assert_that!(session.sequence_number(), eq(10));
    }

    #[googletest::test]
    fn test_exit_failure_disables_session() {
        let mut transport = MockTransport::new();
        transport
            .expect_transmit()
            .times(1)
            .returning(|_, _| Err(TransportError::ExitFailed { reason: "VMGEXIT failed" }));
        let session = session(10, transport);

        let result = session.get_report(&ReportRequest::new([0; 64]));

        assert!(matches!(result, Err(SessionError::Transport { .. })));
        assert_that!(session.is_active(), eq(false));
        assert_that!(session.sequence_number(), eq(12));
    }

    #[googletest::test]
    fn test_transport_error_after_busy_disables_session() {
        let mut transport = MockTransport::new();
        let mut sequence = mockall::Sequence::new();
        transport
            .expect_transmit()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(TransportOutcome::Busy));
        transport
            .expect_transmit()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Err(TransportError::AddressTranslation { buffer: "response" }));
        let session = session(10, transport);

        let result = session.get_report(&ReportRequest::new([0; 64]));

        assert!(matches!(result, Err(SessionError::Transport { .. })));
        assert_that!(session.is_active(), eq(false));
        assert_that!(session.sequence_number(), eq(12));
    }

    #[googletest::test]
    fn test_exhausted_sequence_number_fails_without_transmitting() {
        let mut transport = MockTransport::new();
        transport.expect_transmit().never();
        let session = session(u32::MAX - 1, transport);

        let result = session.get_report(&ReportRequest::new([0; 64]));

        assert!(matches!(result, Err(SessionError::Envelope { .. })));
        assert_that!(session.is_active(), eq(true));
        assert_that!(session.sequence_number(), eq(u32::MAX - 1));
    }

    #[googletest::test]
    fn test_hard_error_reports_both_error_codes() {
        let mut transport = MockTransport::new();
        transport
            .expect_transmit()
            .times(1)
            .returning(|_, _| Ok(TransportOutcome::HardError { exit_info_2: (3 << 32) | 0x16 }));
        let session = session(10, transport);

        let result = session.get_report(&ReportRequest::new([0; 64]));

        assert!(matches!(
            result,
            Err(SessionError::Firmware { vmm_error: 3, firmware_error: 0x16 })
        ));
        assert_that!(session.is_active(), eq(false));
        assert_that!(session.sequence_number(), eq(12));
    }

    #[googletest::test]
    fn test_extended_report_rejects_invalid_buffers() {
        let mut transport = MockTransport::new();
        transport.expect_transmit_extended().never();
        transport.expect_transmit().never();
        let session = session(10, transport);
        let request = ReportRequest::new([0; 64]);

        let mut unaligned = [0u8; 100];
        assert!(matches!(
            session.get_extended_report(&request, &mut unaligned),
            Err(SessionError::InvalidCertificateBuffer { len: 100 })
        ));
        let mut too_large = std::vec![0u8; 5 * PAGE_SIZE];
        assert!(matches!(
            session.get_extended_report(&request, &mut too_large),
            Err(SessionError::InvalidCertificateBuffer { .. })
        ));
        assert_that!(session.is_active(), eq(true));
        assert_that!(session.sequence_number(), eq(10));
    }

    #[googletest::test]
    fn test_extended_report_with_empty_buffer_is_plain_report() {
        let mut transport = MockTransport::new();
        transport.expect_transmit_extended().never();
        transport.expect_transmit().times(1).returning(|request, response| {
            answer(request, response, &[0x5a; 64]);
            Ok(TransportOutcome::Success)
        });
        let session = session(10, transport);

        let report = session.get_extended_report(&ReportRequest::new([0; 64]), &mut []).unwrap();

        assert_that!(
            report,
            eq(&ExtendedReport::Report {
                report: ReportResponse { data: std::vec![0x5a; 64] },
                certs_len: 0
            })
        );
    }
}
