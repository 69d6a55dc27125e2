//! Azure device-code authentication gateway.
//!
//! This library provides the core components for the azgate backend:
//! device-code login orchestration, in-memory session management, and the
//! request-time security gates (CSRF, rate limiting, fingerprint checks).

pub mod api;
pub mod auth;
pub mod azcli;
pub mod chat;
pub mod config;
pub mod security;
pub mod session;
