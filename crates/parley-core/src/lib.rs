//! Shared vocabulary for the parley conversation orchestrator.
//!
//! Everything that crosses a crate boundary lives here: identifiers, the
//! conversation [`messages::Message`] log entries, the model backend
//! boundary ([`backend::ModelBackend`] and [`stream::ResponseEvent`]), the
//! tool boundary ([`tools::ToolExecutor`]) and the response sink boundary
//! ([`sink::ResponseSink`]). [`enrich::InputEnricher`] is the optional hook
//! for rewriting input before it is sent.

pub mod backend;
pub mod enrich;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod sink;
pub mod stream;
pub mod tools;
