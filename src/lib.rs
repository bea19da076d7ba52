pub mod chat;
pub mod client;
pub mod config;
pub mod graph;
pub mod persistence;
pub mod reconciler;

// Re-export commonly used types
pub use chat::ChatGateway;
pub use client::{AssistantClient, RunStatus, ServiceError};
pub use persistence::AssistantConfig;
pub use reconciler::{ReadyStatus, ResourceReconciler};
