// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod client;
mod mock;
mod rest;
mod types;

pub use client::{CachedContent, ChunkStream, ModelClient};
pub use mock::ScriptedMockClient;
pub use rest::RestClient;
pub use types::{
    ContentPart, ContentRecord, ContentRole, GenerationConfig, ModelRequest, RawFrame,
    RawFunctionCall, RawPart, StreamEvent, ToolSchema, UsageMetadata,
};
