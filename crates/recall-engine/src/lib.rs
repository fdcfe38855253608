pub mod assets;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod locks;
pub mod orchestrator;
pub mod prompt;
pub mod registry;
pub mod request;
pub mod response;
pub mod streaming;
pub mod trace;

pub use config::{EngineConfig, DEFAULT_MAX_MODEL_CALLS};
pub use error::{EngineError, ValidationError};
pub use orchestrator::Orchestrator;
pub use registry::ToolRegistry;
pub use request::{AssetRef, PromptRequest};
pub use response::PromptResponse;
