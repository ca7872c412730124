#![warn(missing_docs)]

//! # vigil-server
//!
//! Interactive sessions and the HTTP front end for Vigil.
//!
//! A session binds one WebSocket connection to one script run. The peer
//! sends the script id, then a start signal, then answers to whatever the
//! script asks through `Input`. The session ends with a single response
//! record, or silently if the peer disconnects first.

pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;

pub use protocol::{Command, InfoMessage, Outbound, Response};
pub use session::{PromptSlot, SessionConfig, SessionController, SessionState};
pub use store::{InMemoryScriptStore, ScriptStore, StoreError, StoredScript};
pub use transport::{router, serve, AppState};
