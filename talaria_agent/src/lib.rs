//! talaria_agent: host telemetry sampled, cached and streamed to dashboard
//! viewers over WebSocket, behind session authentication.

pub mod aggregator;
pub mod cache;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod error;
pub mod http;
pub mod hub;
pub mod logging;
pub mod process;
pub mod providers;
pub mod session;
pub mod state;
pub mod storage;
pub mod tls;
pub mod types;
pub mod ws;
