//! Server-side session state.

mod store;

pub use store::{SessionIdentity, SessionRecord, SessionStore};
