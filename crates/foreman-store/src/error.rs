// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// An operation was invoked outside a connect()/disconnect() scope.
    #[error("store is not connected")]
    NotConnected,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration {version} failed: {source}")]
    Migration {
        version: i32,
        #[source]
        source: sqlx::Error,
    },
}
