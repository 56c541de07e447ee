//! Echo relay core: credential selection, inbound authentication, echo bot logic,
//! outbound delivery, and the HTTP gateway that ties them together.

pub mod activity;
pub mod auth;
pub mod bot;
pub mod config;
pub mod credentials;
pub mod delivery;
pub mod diagnose;
pub mod gateway;
pub mod relay;
pub mod token;
