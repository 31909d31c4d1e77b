// Copyright 2025 AMRPC Authors
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

//! # AMRPC CLI
//!
//! Command-line interface for amrpc services.
//!
//! ## Key Commands
//!
//! - `amrpc serve`: Run a server exposing the built-in demo endpoints
//! - `amrpc call`: Make an RPC call (outputs raw JSON for scripting)
//! - `amrpc publish`: Fire-and-forget publish to an endpoint
//!
//! Broker and namespace settings come from `AMRPC_*` environment variables
//! and may be overridden per command with flags.

pub mod demo;

use amrpc_common::Envelope;
use anyhow::{anyhow, Result};

/// Parses the `--args` / `--kwargs` JSON strings into an envelope.
///
/// # Errors
///
/// Returns an error if either string is not valid JSON, if `args` is not
/// an array or if `kwargs` is not an object.
pub fn parse_envelope(args: &str, kwargs: &str) -> Result<Envelope> {
    let args: serde_json::Value =
        serde_json::from_str(args).map_err(|e| anyhow!("Invalid JSON in args: {}", e))?;
    let kwargs: serde_json::Value =
        serde_json::from_str(kwargs).map_err(|e| anyhow!("Invalid JSON in kwargs: {}", e))?;
    Ok(Envelope::from_json(args, kwargs)?)
}
