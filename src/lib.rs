//! # claude-duplex
//!
//! Drive the Claude Code CLI as a long-lived child process speaking
//! newline-delimited JSON over stdin/stdout.
//!
//! The crate provides:
//! - Persistent process managers that keep one CLI child alive across turns
//!   ([`PersistentProcess`] on OS threads, [`AsyncPersistentProcess`] on
//!   tokio tasks)
//! - Session clients that push decoded messages into a handler
//!   ([`ClaudeClient`], [`AsyncClaudeClient`])
//! - One-shot queries that run the CLI once per prompt ([`query`](fn@query),
//!   [`async_query`])
//! - A never-failing decoder for the CLI's output ([`Message::decode`])
//!
//! ## Quick Start
//!
//! ```no_run
//! use claude_duplex::{query_text, ClientConfig, Result};
//!
//! fn main() -> Result<()> {
//!     let answer = query_text("What is 2+2?", &ClientConfig::default())?;
//!     println!("{answer}");
//!     Ok(())
//! }
//! ```
//!
//! ## Sessions
//!
//! ```no_run
//! use claude_duplex::{ClaudeClient, ClientConfig, Model};
//!
//! # fn main() -> claude_duplex::Result<()> {
//! let config = ClientConfig::builder().model(Model::Sonnet).build()?;
//! let client = ClaudeClient::new(config);
//! client.connect()?;
//! client.query("My name is Alice.")?;
//! let reply = client.query("What's my name?")?;
//! # let _ = reply;
//! client.disconnect();
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom handlers
//!
//! ```no_run
//! use claude_duplex::{ClaudeClient, ClientConfig, Message, MessageHandler, Result};
//!
//! struct Printer;
//!
//! impl MessageHandler for Printer {
//!     fn on_message(&self, message: Message) -> Result<()> {
//!         println!("{}", message.kind());
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let client = ClaudeClient::with_handler(ClientConfig::default(), Printer);
//! client.connect()?;
//! client.send_request("Hello")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Debugging
//!
//! Set `CLAUDE_SDK_DEBUG=true` to trace every line crossing the pipes at
//! `debug` level. The variable is read once when a [`ClientConfig`] is
//! created; [`ClientConfigBuilder::debug`] overrides it.

pub mod client;
pub mod config;
mod error;
pub mod handler;
pub mod process;
pub mod protocol;
pub mod query;

pub use error::{Error, Result};

// Re-export the main client types at crate root
pub use client::{AsyncClaudeClient, ClaudeClient};
pub use handler::{
    AsyncDefaultMessageHandler, AsyncMessageHandler, DefaultMessageHandler, MessageHandler,
};

// Re-export commonly used config types at crate root
pub use config::{ClientConfig, ClientConfigBuilder, Model, PermissionMode, SessionId};

// Re-export commonly used protocol types at crate root
pub use protocol::{ContentBlock, Message, OutboundMessage, Usage};

// Re-export commonly used process types at crate root
pub use process::{AsyncPersistentProcess, CommandSpec, PersistentProcess, SpawnOptions};

pub use query::{
    async_query, async_query_command, async_query_text, query, query_command, query_text,
    AsyncQueryMessages, QueryMessages,
};
