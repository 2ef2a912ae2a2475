//! Conversation memory
//!
//! Short-term memory is the per-session [`ContextWindow`], kept under a token
//! budget by [`ContextManager`]. Long-term memory is the [`ConversationStore`],
//! which records every completed turn keyed by session id.
//!
//! # Example
//!
//! ```rust,ignore
//! use nephele_core::conversation::{ContextManager, Session, Turn};
//! use nephele_core::workflow::RouteKind;
//!
//! let manager = ContextManager::new(4000);
//! let mut session = Session::new("session-1");
//! manager.append(&mut session, Turn::new("Hi", RouteKind::Direct, vec![], None, "Hello!"));
//!
//! let window = manager.window(&session);
//! assert_eq!(window.len(), 1);
//! ```

mod session;
mod store;
mod turn;
mod window;

pub use session::{Session, SessionHandle, SessionRegistry, new_session_id};
pub use store::{
    ConversationStore, InMemoryConversationStore, JsonlConversationStore, PersistenceError,
    SessionSummary,
};
pub use turn::{Turn, estimate_tokens};
pub use window::{ContextManager, ContextWindow};
