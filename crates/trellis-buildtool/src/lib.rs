//! Client for the external build tool: cached structural queries and
//! build/test/run invocations with a decoded event stream

pub mod client;
pub mod events;
pub mod invocation;
pub mod query;

#[cfg(test)]
pub mod tests;

pub use client::{BuildToolClient, TargetInfo};
pub use events::{BuildEvent, EventTail, TestOutcome, decode_event};
pub use invocation::{InvocationReport, InvocationRequest, InvocationStatus};
pub use query::{QueryAttribute, QueryResult, QueryTarget, decode_query_output};
