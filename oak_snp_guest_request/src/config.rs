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

use alloc::{format, string::String};
use core::time::Duration;

use derive_builder::Builder;

use crate::{
    guest::CURRENT_MESSAGE_VERSION,
    retry::{RetryPolicy, DEFAULT_MAX_RETRY_DURATION, DEFAULT_RETRY_DELAY},
    secrets::VmpckId,
    PAGE_SIZE,
};

/// The largest certificate buffer accepted by default. This matches the
/// firmware blob limit of the Linux driver.
pub const DEFAULT_MAX_CERTIFICATE_LEN: usize = 4 * PAGE_SIZE;

/// Settings of a guest request session. They are fixed for the lifetime of the
/// session.
#[derive(Builder, Clone, Debug, PartialEq)]
#[builder(no_std)]
#[builder(pattern = "owned")]
#[builder(build_fn(validate = "Self::validate"))]
pub struct SessionConfig {
    /// The VM platform communication key used for all requests.
    #[builder(default)]
    pub vmpck_id: VmpckId,

    /// The message version placed in request headers. Must not be 0.
    #[builder(default = "CURRENT_MESSAGE_VERSION")]
    pub message_version: u8,

    /// How long to wait before retrying while the host is busy.
    #[builder(default = "DEFAULT_RETRY_DELAY")]
    pub retry_delay: Duration,

    /// How long the host may stay busy before a request fails.
    #[builder(default = "DEFAULT_MAX_RETRY_DURATION")]
    pub max_retry_duration: Duration,

    /// The largest certificate buffer accepted for extended reports. Must be a
    /// whole number of pages.
    #[builder(default = "DEFAULT_MAX_CERTIFICATE_LEN")]
    pub max_certificate_len: usize,
}

impl SessionConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.message_version == Some(0) {
            return Err(String::from("message version must not be 0"));
        }
        if let Some(len) = self.max_certificate_len {
            if len % PAGE_SIZE != 0 {
                return Err(format!("max certificate length {len} is not a whole number of pages"));
            }
        }
        Ok(())
    }
}

impl SessionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { retry_delay: self.retry_delay, max_retry_duration: self.max_retry_duration }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vmpck_id: VmpckId::default(),
            message_version: CURRENT_MESSAGE_VERSION,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_duration: DEFAULT_MAX_RETRY_DURATION,
            max_certificate_len: DEFAULT_MAX_CERTIFICATE_LEN,
        }
    }
}
