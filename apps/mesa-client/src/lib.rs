//! Client-side session and real-time synchronization core for the Mesa
//! ordering application.
//!
//! Three coupled concerns live here: the persisted session (credential,
//! identity, role) built on top of [`token`] decoding, the long-lived push
//! channel that delivers coarse "state changed" signals, and the per-resource
//! caches plus the refresh policy that keeps them converging on the server's
//! view. Screens, DTO shapes, and the HTTP client proper stay outside; they
//! talk to this crate through the [`cache::ResourceSource`] and
//! [`session::KeyValueStore`] seams.

pub mod cache;
pub mod channel;
pub mod config;
pub mod session;
pub mod sync;
pub mod telemetry;

pub use mesa_token as token;
