//! Gateway: the HTTP surface of the bot.
//!
//! Single port: `POST /api/messages` (relay), `GET /health`, and `GET /` (status page).

mod server;

pub use server::{build_relay, router, run_server, serve, HEALTH_TEXT};
