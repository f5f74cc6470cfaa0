// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP front: request parsing, query handling, response framing and
//! the SSE status stream. Routing itself lives with the worker, which
//! owns the connection and service state the routes act on.

/// Incremental request head parser.
pub mod parser;
/// Typed, ordered query-parameter map with positional override merge.
pub mod query;
/// Response framing.
pub mod response;
/// SSE snapshot composition.
pub mod sse;
/// Embedded `/status` dashboard.
pub mod status_page;

pub use parser::{Method, Request};
pub use query::QueryMap;
pub use response::Status;
