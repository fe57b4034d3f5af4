//! HTTP protocol implementation.
//!
//! This module implements the HTTP/1.1 side of the server: reading requests
//! off a socket, driving them through the module pipeline and writing the
//! response back, reusing the connection where the client allows it.
//!
//! # Architecture
//!
//! - **`connection`**: The connection handler implementing the request lifecycle state machine
//! - **`socket`**: Buffered client socket with bounded, timed line and body reads
//! - **`parser`**: Request line, header, form and multipart parsing
//! - **`request`**: HTTP request representation
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: Serializes and writes HTTP responses to the client
//! - **`error_page`**: Templated or plain text error bodies
//! - **`mime`**: MIME type detection based on file extensions
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │    Idle     │ ← REQUEST_PRE
//!        └──────┬──────┘
//!               ▼
//!   ReadStartLine → ReadHeaders → ReadBody
//!               │
//!               ▼
//!        ┌──────────────────┐
//!        │   Dispatching    │ ← REQUEST_POST (stops at first dispatch)
//!        └──────┬───────────┘
//!               │ Dispatched | Error (error page)
//!               ▼
//!        ┌──────────────────┐
//!        │  SendResponse    │ ← RESPONSE_PRE, write, RESPONSE_POST
//!        └──────┬───────────┘
//!               ├─ KeepAlive → Idle (same connection)
//!               └─ Closed
//! ```
//!
//! Transport failures (timeouts, resets) leave the loop without answering.

pub mod connection;
pub mod error_page;
pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod socket;
pub mod writer;
