// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod client;
pub mod error;
pub mod flatten;
pub mod http;
pub mod mock;
pub mod snapshot;
pub mod types;

pub use client::{AbortOutcome, EventStream, HostApi};
pub use error::HostError;
pub use flatten::flatten_parts;
pub use http::HttpHostClient;
pub use mock::MockHost;
pub use snapshot::SessionSnapshot;
pub use types::{FlatPart, SessionInfo};
