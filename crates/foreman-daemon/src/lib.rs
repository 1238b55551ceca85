// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod backoff;
mod catchup;
mod ingest;
mod lifecycle;

pub use backoff::Backoff;
pub use catchup::CatchupStats;
pub use lifecycle::{Daemon, DaemonHandle, DaemonOptions, DaemonState};
