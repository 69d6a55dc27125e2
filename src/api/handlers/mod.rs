//! HTTP request handlers.

pub mod admin;
pub mod authorize;
pub mod chat;
pub mod me;
pub mod misc;
