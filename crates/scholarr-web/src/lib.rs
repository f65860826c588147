//! REST + SSE surface over the Scholarr core. Handlers are thin adapters:
//! envelope in, repository or scheduler call, envelope out.

pub mod auth;
pub mod envelope;
pub mod handlers;
pub mod router;
pub mod sse;
pub mod state;
