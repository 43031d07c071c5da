//! HTTP and WebSocket front-end for the venn proxy.

pub mod client_ip;
pub mod logging;
pub mod router;
pub mod ws;
