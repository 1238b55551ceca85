// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod classify;
pub mod event;
pub mod hash;
pub mod punch;
pub mod records;

pub use classify::classify;
pub use event::{EventKind, HostEvent, Part, PartState, SessionRef, TokenUsage};
pub use hash::{canonical_json, event_source_hash, text_hash, value_hash};
pub use punch::{Punch, PunchType};
pub use records::{CardRequirement, ChildRelation, MessageRecord, SessionRecord, ToolCallRecord};
