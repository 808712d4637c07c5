//! A FIX 4.x/5.0 session engine.
//!
//! fixlink multiplexes initiator and acceptor FIX sessions over TCP. Each
//! session runs the full administrative state machine: logon handshake,
//! heartbeats and test requests, sequence discipline with gap recovery,
//! resend replay backed by an append-only message log, reject handling and
//! graceful logout. Application messages are claimed from a pre-allocated
//! pool, filled in, and committed on a thread-safe send path; inbound
//! messages reach the application through listener callbacks.
//!
//! ## Terminology
//! * `FIX connection` — one TCP connection carrying a logon handshake and
//!   the message flow until logout or breakage.
//! * `FIX session` — the long-lived, sequence-numbered conversation
//!   identified by a (SenderCompID, TargetCompID) pair; it survives across
//!   connections unless sequence numbers are reset.
//! * `Engine` — owns the set of sessions, the listeners and dial loops,
//!   and the keepalive tick that drives every session's timers.
//!
//! ## Example
//! ```no_run
//! use fixlink::{Engine, SessionConfig, SessionRole};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::builder()
//!         .with_session_name("uat")
//!         .with_sender_comp_id("MYFIRM")
//!         .with_target_comp_id("BROKER")
//!         .with_role(SessionRole::Initiator)
//!         .with_host("10.1.2.3")
//!         .with_port(9880)
//!         .with_reset_on_logon(true)
//!         .build()?;
//!
//!     let engine = Arc::new(Engine::new());
//!     let session = engine.add_session(config)?;
//!     engine.start().await?;
//!
//!     // ... wait for logon, then send:
//!     if let Some(mut order) = session.try_claim('D') {
//!         order.push_str(11u32, "order-1");
//!         order.push_str(55u32, "TICKER");
//!         let seq = session.commit(order)?;
//!         println!("sent with MsgSeqNum {seq}");
//!     }
//!
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod fix;
pub mod net;

pub use config::{BeginString, ConfigError, SessionConfig, SessionConfigBuilder, SessionRole};
pub use engine::{Engine, EngineError};
pub use fix::mem::{IncomingMessage, MsgBuf};
pub use fix::pool::OutgoingMessage;
pub use fix::session::{MessageListener, Session, SessionState, StateListener};
pub use fix::store::{Direction, LogEntry, LogStore, MemoryLogStore};
pub use fix::{SessionError, SessionId};

#[cfg(feature = "sqlite")]
pub use fix::sqlite_store::SqliteLogStore;
