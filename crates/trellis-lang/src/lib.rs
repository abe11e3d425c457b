//! Language coordination: graph-first resolution with fallthrough to
//! per-language engines

pub mod adapter;
pub mod adapters;
pub mod coordinator;
pub mod protocol;
pub mod rpc;
pub mod supervisor;
pub mod text;

#[cfg(test)]
pub mod tests;

pub use adapter::{Capabilities, EngineAdapter, ImportRules, LanguageAdapter};
pub use adapters::{create_adapter, language_for_path};
pub use coordinator::LanguageCoordinator;
pub use protocol::{CompletionItem, CompletionKind, DocumentRef, Hover};
pub use rpc::RpcConnection;
pub use supervisor::{EngineCommand, EngineStatus, EngineSupervisor, backoff_delay};
