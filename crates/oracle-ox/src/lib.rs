//! Advisory analysis client for stuck migration workers.
//!
//! Wraps a chat-completion endpoint behind a typed interface: the supervisor
//! hands over diagnostics, gets back a structured [`Advice`], and remains
//! free to discard it. Responses are parsed strictly; anything that does not
//! decode degrades to a low-confidence restart recommendation.

mod client;
mod prompt;
mod response;

pub use client::{OracleClient, OracleError};
pub use prompt::{CodeSnippet, Diagnostics, build_prompt};
pub use response::{Advice, FixKind, parse_advice};
