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

//! The state machine that drives a single guest request through host
//! throttling and certificate negotiation.
//!
//! The machine is pure: the session performs the side effects that each state
//! asks for (transmitting, sleeping) and feeds the result back in as an
//! `Event`.

use core::time::Duration;

use crate::transport::{TransportOutcome, VMM_ERROR_INVALID_LEN, VMM_ERROR_SHIFT};

/// The delay between attempts while the host reports that it is busy.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// How long the host may stay busy before the request is abandoned.
pub const DEFAULT_MAX_RETRY_DURATION: Duration = Duration::from_secs(60);

/// Which exit a request goes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// A plain guest request.
    Standard,
    /// A guest request that also fetches the host's certificate chain.
    Extended,
}

/// How a request ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The firmware answered.
    Success,
    /// The firmware answered a request that was reissued without the
    /// certificate fetch, because the certificate buffer was too small.
    CertBufferTooSmall { required_pages: u64 },
    /// The host stayed busy for too long.
    Timeout,
    /// The host or the firmware reported an error.
    FirmwareError { exit_info_2: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Transmit the request. `negotiated_pages` is set once the request has
    /// been downgraded after a certificate size negotiation.
    Issue { kind: RequestKind, negotiated_pages: Option<u64> },
    /// Wait for the retry delay before transmitting again.
    Backoff { kind: RequestKind, negotiated_pages: Option<u64> },
    /// Drop the certificate fetch and reissue the same envelope.
    DowngradeAndReissue { required_pages: u64 },
    /// The request is complete. Terminal.
    Finalize(Completion),
}

impl RequestState {
    pub fn initial(kind: RequestKind) -> Self {
        RequestState::Issue { kind, negotiated_pages: None }
    }
}

/// What happened since the state was entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The request was transmitted with the given outcome.
    Transmitted(TransportOutcome),
    /// The wait requested by `Backoff` or `DowngradeAndReissue` is over.
    Resumed,
}

/// Timing parameters of the retry loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait in `Backoff`.
    pub retry_delay: Duration,
    /// Once this much time has passed since the first attempt, a busy host
    /// ends the request with a timeout.
    pub max_retry_duration: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retry_delay: DEFAULT_RETRY_DELAY, max_retry_duration: DEFAULT_MAX_RETRY_DURATION }
    }
}

impl RetryPolicy {
    /// Computes the next state.
    ///
    /// `elapsed` is the time since the first attempt of the request. Pairs of
    /// state and event that don't make sense leave the state unchanged.
    pub fn transition(&self, state: RequestState, event: Event, elapsed: Duration) -> RequestState {
        match (state, event) {
            (RequestState::Issue { kind, negotiated_pages }, Event::Transmitted(outcome)) => {
                match outcome {
                    TransportOutcome::Success => RequestState::Finalize(match negotiated_pages {
                        Some(required_pages) => Completion::CertBufferTooSmall { required_pages },
                        None => Completion::Success,
                    }),
                    TransportOutcome::Busy if elapsed < self.max_retry_duration => {
                        RequestState::Backoff { kind, negotiated_pages }
                    }
                    TransportOutcome::Busy => RequestState::Finalize(Completion::Timeout),
                    TransportOutcome::CertBufferTooSmall { required_pages }
                        if kind == RequestKind::Extended =>
                    {
                        RequestState::DowngradeAndReissue { required_pages }
                    }
                    // A standard request has no certificate buffer to be too small.
                    TransportOutcome::CertBufferTooSmall { .. } => {
                        RequestState::Finalize(Completion::FirmwareError {
                            exit_info_2: VMM_ERROR_INVALID_LEN << VMM_ERROR_SHIFT,
                        })
                    }
                    TransportOutcome::HardError { exit_info_2 } => {
                        RequestState::Finalize(Completion::FirmwareError { exit_info_2 })
                    }
                }
            }
            (RequestState::Backoff { kind, negotiated_pages }, Event::Resumed) => {
                RequestState::Issue { kind, negotiated_pages }
            }
            (RequestState::DowngradeAndReissue { required_pages }, Event::Resumed) => {
                RequestState::Issue {
                    kind: RequestKind::Standard,
                    negotiated_pages: Some(required_pages),
                }
            }
            (state, _) => state,
        }
    }
}
