//! Coaching Backend Integration
//!
//! Access to the coaching service through the [`CoachingBackend`] and
//! [`StreamTransport`] traits.
//!
//! # Available Backends
//!
//! - **HTTP**: the coaching REST API plus the `/chat-stream` SSE endpoint
//! - **In-memory**: canned persona greetings and replies rendered as SSE,
//!   for offline use and tests
//!
//! # Usage
//!
//! ```ignore
//! use coach_core::backend::{HttpBackend, StreamRequest, StreamTransport};
//!
//! let backend = HttpBackend::from_env()?;
//! let bytes = backend.open_stream(&StreamRequest::greeting(id, persona)).await?;
//! ```

mod http;
mod memory;
mod traits;

pub use http::{HttpBackend, DEFAULT_API_URL};
pub use memory::{greeting_for, style_for, InMemoryBackend, StreamScript, DEFAULT_REPLIES};
pub use traits::{ByteStream, CoachingBackend, NewSession, StreamRequest, StreamTransport};
