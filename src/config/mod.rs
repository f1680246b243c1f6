//! Configuration for the Claude CLI.
//!
//! This module provides:
//!
//! - [`ClientConfig`] and [`ClientConfigBuilder`] covering the CLI's flags
//! - Typed flag values like [`Model`], [`PermissionMode`] and [`SessionId`]
//! - Command construction for persistent sessions
//!   ([`ClientConfig::persistent_command`]) and one-shot runs
//!   ([`ClientConfig::oneshot_command`])
//!
//! # Example
//!
//! ```ignore
//! use claude_duplex::config::{ClientConfig, Model};
//!
//! let config = ClientConfig::builder()
//!     .model(Model::Sonnet)
//!     .allowed_tools(["Read", "Grep"])
//!     .build()?;
//! ```

pub mod builder;
pub mod options;

pub use builder::{ClientConfig, ClientConfigBuilder, JsonArg, DEBUG_ENV, DEFAULT_QUERY_TIMEOUT};
pub use options::{InputFormat, Model, OutputFormat, PermissionMode, SessionId};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_exports_accessible() {
        let _: Model = Model::Sonnet;
        let _: PermissionMode = PermissionMode::Default;
        let _: SessionId = SessionId::new("test");
        let _: OutputFormat = OutputFormat::StreamJson;
        let _: InputFormat = InputFormat::StreamJson;
        let _: JsonArg = JsonArg::from("path.json");
        let _ = ClientConfig::builder();
    }
}
