//! Resilient session client for the Statefull websocket protocol
//!
//! The client talks to a control plane over HTTP to discover its settings
//! and get a node assigned, then holds a stateful websocket session against
//! that node and keeps it alive across disconnects.
//!
//! # Architecture
//!
//! The crate is organized by concern, with each module having a single
//! responsibility:
//!
//! | Module       | Responsibility                                      |
//! |--------------|-----------------------------------------------------|
//! | `close_code` | Close-code registry and reason-string parsing       |
//! | `store`      | Token and ban persistence, ban gate                 |
//! | `allocator`  | Settings discovery and node allocation over HTTP    |
//! | `handshake`  | Token handshake over one websocket connection       |
//! | `engine`     | Generation-fenced reconnect loop                    |
//!
//! # Key Design Principles
//!
//! ## 1. Close Codes Are the Control Protocol
//!
//! - Servers direct the client through close codes in the 3000 range
//! - Reasons carry a `"<SYMBOLIC_ID>[: <payload>]"` tag that survives even
//!   when a proxy degrades the code to a bare 1006
//!
//! ## 2. Generations Instead of Cancellation
//!
//! - `start()`/`stop()` bump a generation counter; loop tasks check it
//!   after every await and bail silently when superseded
//! - Stale timer and socket completions never touch current state
//!
//! ## 3. Bans Outlive the Process
//!
//! - A BAN closure persists a cooldown record through the injected store
//! - `start()` refuses while the record is active, so no reconnect storm
//!   can talk past a ban
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use statefull_client::{ClientConfig, MemoryStore, NoRestart, ReconnectEngine, SessionEvent};
//!
//! let config = ClientConfig {
//!     base_url_override: Some("https://play.example.com".into()),
//!     ..Default::default()
//! };
//! let (engine, mut events) =
//!     ReconnectEngine::new(config, Arc::new(MemoryStore::new()), Arc::new(NoRestart))?;
//! engine.start()?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Message(text) => println!("{text}"),
//!         SessionEvent::Failed(reason) => break,
//!         _ => {}
//!     }
//! }
//! ```

pub mod allocator;
pub mod close_code;
pub mod config;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod store;
pub mod types;

pub use allocator::NodeAllocator;
pub use close_code::{
    build_reason, code_for_id, describe, CloseCodeMeta, CloseInfo, STATEFULL_ALLOCATE_NODE,
    STATEFULL_BAN, STATEFULL_ERROR, STATEFULL_KICK, STATEFULL_NORMAL_CLOSE,
    STATEFULL_PROTOCOL_PROBLEM,
};
pub use config::{ApiLocation, ClientConfig};
pub use engine::{EngineStatus, ReconnectEngine, SessionEvent};
pub use error::{AllocationErrorKind, Result, SessionError};
pub use handshake::{HandshakeSocket, JsonObject, SocketEvent, SocketEvents};
pub use store::{
    BanGate, MemoryStore, NoRestart, RestartSignal, SessionStore, SessionStorage,
    SESSION_TOKEN_KEY,
};
pub use types::{BanRecord, SessionSettings};
