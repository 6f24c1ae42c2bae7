// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub model: ModelSettings,
    /// Maximum number of tool calls a single agent invocation may execute.
    /// Exceeding the cap ends the invocation with a well-known error text
    /// rather than an error return.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
    /// IANA timezone name used for every timestamp written to disk.
    /// Unknown names fall back to UTC with a warning at service construction.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Default sampling parameters; a session's own hyperparameters override
    /// these per request.
    #[serde(default)]
    pub parameters: Hyperparameters,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
            max_tool_calls: default_max_tool_calls(),
            timezone: default_timezone(),
            parameters: Hyperparameters::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Client selector: "rest" (streaming HTTP) or "mock" (tests, dry runs).
    pub provider: String,
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Base URL override for the rest client.
    pub base_url: Option<String>,
    /// Hard ceiling on prompt size; a request estimated above this limit is
    /// rejected before any network call.
    #[serde(default = "default_context_limit")]
    pub context_limit: u64,
    /// Buffered-token threshold above which the remote content cache is
    /// created or refreshed.
    #[serde(default = "default_cache_update_threshold")]
    pub cache_update_threshold: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: "rest".into(),
            name: "takt-default".into(),
            api_key_env: None,
            base_url: None,
            context_limit: default_context_limit(),
            cache_update_threshold: default_cache_update_threshold(),
        }
    }
}

/// Sampling parameter overrides. All fields optional so that a session can
/// override any subset of the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

impl Hyperparameters {
    /// Layer `other` on top of `self`: any field set in `other` wins.
    pub fn merged_with(&self, other: &Hyperparameters) -> Hyperparameters {
        Hyperparameters {
            temperature: other.temperature.or(self.temperature),
            top_p: other.top_p.or(self.top_p),
            top_k: other.top_k.or(self.top_k),
        }
    }
}

fn default_max_tool_calls() -> u32 {
    25
}

fn default_timezone() -> String {
    "UTC".into()
}

fn default_context_limit() -> u64 {
    1_048_576
}

fn default_cache_update_threshold() -> u64 {
    32_768
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
