//! HTTP server for gantry.
//!
//! Receives webhooks from the git hosting service, decides which pull requests
//! may be built, and exposes endpoints to trigger builds and discovery by hand.

pub mod admission;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::Admission;
pub use state::AppState;
