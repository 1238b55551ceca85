// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("host error: {0}")]
    Host(#[from] foreman_host::HostError),

    #[error("store error: {0}")]
    Store(#[from] foreman_store::StoreError),
}
