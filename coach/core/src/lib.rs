//! Coach Core - Headless Conversation Engine for Coachline
//!
//! This crate holds the real-time conversation engine of the Coachline
//! coaching client, independent of any UI. A terminal, a GUI or a test
//! harness drives it through the [`SessionController`] and renders the
//! [`CoachEvent`]s it emits.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          UI Surfaces                             │
//! │        ┌─────────┐     ┌──────────────┐     ┌──────────────┐     │
//! │        │   CLI   │     │  GUI / Web   │     │  Test Harness│     │
//! │        └────┬────┘     └──────┬───────┘     └──────┬───────┘     │
//! │             └─────────────────┼────────────────────┘             │
//! │                 &mut calls ▼  │  ▲ CoachEvent                    │
//! └───────────────────────────────┼──────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                          COACH CORE                              │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │                    SessionController                       │  │
//! │  │  ┌──────────────┐ ┌──────────────┐ ┌────────────────────┐  │  │
//! │  │  │ Conversation │ │ SafetySignal │ │ Streaming          │  │  │
//! │  │  │ State        │ │ Detector     │ │ (SseDecoder, turn) │  │  │
//! │  │  └──────────────┘ └──────────────┘ └─────────┬──────────┘  │  │
//! │  └──────────────────────────────────────────────┼─────────────┘  │
//! │  ┌──────────────┐ ┌──────────────┐ ┌────────────┴───────────┐    │
//! │  │ SessionStore │ │ Connection   │ │ CoachingBackend /      │    │
//! │  │ (memory,json)│ │ Manager      │ │ StreamTransport        │    │
//! │  └──────────────┘ └──────────────┘ └────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use coach_core::{
//!     backend::InMemoryBackend, persistence::MemoryStore, InputMode, Persona,
//!     SessionController, SessionType,
//! };
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (tx, mut rx) = mpsc::unbounded_channel();
//!     let backend = Arc::new(InMemoryBackend::new());
//!     let mut controller =
//!         SessionController::new(backend.clone(), backend, Arc::new(MemoryStore::new()), tx);
//!
//!     controller
//!         .start_session("me", Persona::SupportiveStrategist, SessionType::CheckIn, InputMode::Text)
//!         .await?;
//!     controller.settle().await;
//!
//!     controller.send_message("I keep putting off a hard conversation")?;
//!     loop {
//!         controller.poll_streaming();
//!         while let Ok(event) = rx.try_recv() {
//!             // Render event
//!         }
//!         if !controller.is_streaming() {
//!             break;
//!         }
//!         tokio::time::sleep(std::time::Duration::from_millis(16)).await;
//!     }
//!     controller.end_session().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: coaching service access (HTTP, in-memory)
//! - [`config`]: layered configuration (defaults, TOML file, environment, CLI)
//! - [`connection`]: persistent connection with heartbeat and reconnect backoff
//! - [`controller`]: the session controller
//! - [`conversation`]: ordered message log and status transitions
//! - [`diagnostics`]: per-message coaching diagnostics and quick replies
//! - [`error`]: error types per layer
//! - [`messages`]: controller events and identifiers
//! - [`persistence`]: local session stores
//! - [`safety`]: crisis and escalation detection
//! - [`session`]: session model
//! - [`streaming`]: SSE decoding and reply turns
//! - [`voice`]: speech capture and playback collaborators

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod connection;
pub mod controller;
pub mod conversation;
pub mod diagnostics;
pub mod error;
pub mod messages;
pub mod persistence;
pub mod safety;
pub mod session;
pub mod streaming;
pub mod voice;

pub use backend::{CoachingBackend, HttpBackend, InMemoryBackend, StreamTransport};
pub use config::{load_config, CoachConfig, ConfigOverrides, ConfigSource};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use controller::{ControllerConfig, HandoffRequest, SessionController};
pub use conversation::{ConversationState, Message, MessageStatus};
pub use diagnostics::{Diagnostics, QuickReply, QuickReplyKind};
pub use error::{CoachError, Rejected, StateError, StreamError, TransportError};
pub use messages::{CoachEvent, MessageId, MessageRole, NotifyLevel, SessionId};
pub use persistence::{JsonFileStore, MemoryStore, SessionStore, SessionSummary};
pub use safety::{is_crisis, CrisisResource, CrisisTrigger, HandoffOutcome, SafetySignalDetector};
pub use session::{InputMode, Persona, Session, SessionType};
pub use streaming::{SseDecoder, Token, TokenStream};
