//! Ports to the engine's external collaborators.

pub mod data_accessor;
pub mod llm_client;
pub mod monitor;

pub use data_accessor::{
    DataAccessor, FieldCategory, FieldManifest, FieldValidation, SharedDataAccessor,
};
pub use llm_client::{LlmClient, LlmRequest, LlmResponse};
pub use monitor::{MonitorEvent, MonitorSink, NullSink, SharedMonitor, Stage};
