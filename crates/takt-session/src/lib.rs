// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod error;
mod lock;
mod model;
mod process;
mod repository;
mod service;
mod streamlog;

pub use error::StoreError;
pub use lock::{
    modify_json_locked, read_json_locked, write_json_locked, FileLock, DEFAULT_LOCK_TIMEOUT,
    STALE_LOCK_THRESHOLD,
};
pub use model::{
    Reference, Session, SessionIndex, SessionOverview, TodoItem, ToolResponsePayload, ToolStatus,
    Turn,
};
pub use process::ProcessRegistry;
pub use repository::SessionRepository;
pub use service::{NewSessionParams, SessionData, SessionMetaPatch, SessionService};
pub use streamlog::StreamingLog;
