//! Dullahan - multi-client terminal multiplexer server.
//!
//! Spawns shells inside PTYs, drives them through a VT emulator, and
//! mirrors their state to browser clients over WebSocket (optionally
//! TLS). One single-threaded poll-driven event loop owns everything.

// Library modules
pub mod client;
pub mod config;
pub mod constants;
pub mod event_loop;
pub mod http;
pub mod ipc;
pub mod notify;
pub mod pane;
pub mod protocol;
pub mod proxy;
pub mod pty;
pub mod session;
pub mod shell;
pub mod stream;
pub mod term;
pub mod tls;
pub mod wire;
pub mod ws;

// Re-export commonly used types
pub use client::{ClientState, Role};
pub use config::{RuntimeDir, ServerConfig};
pub use event_loop::EventLoop;
pub use notify::NotifyPipe;
pub use pane::{Pane, PaneId, PaneState};
pub use protocol::ClientMessage;
pub use session::{PaneRegistry, Session, Window, WindowId};
pub use stream::Stream;
pub use term::{Emulator, MouseEncoding};
