//! Warden Proxy - policy core of an intercepting TLS/HTTP proxy.
//!
//! Every client connection is decided once (intercept, passthru or block),
//! every request inside it is matched against the remote policy service, and
//! matched responses are streamed through the remote filter in bounded
//! chunks.
//!
//! ## Architecture
//!
//! ```text
//! CONNECT ─▶ Gatekeeper ─┬─ block ─────▶ 403
//!                        ├─ passthru ──▶ raw tunnel (flex host: router tunnel)
//!                        └─ intercept ─▶ TLS termination
//!                                              │
//! request ─▶ RequestRouter ─┬─ health / redirect / abort ─▶ synthetic response
//!                           ├─ flex host ─▶ FlexRouting ─▶ router or fallback page
//!                           └─ forward ─▶ upstream
//!                                              │
//! response ─▶ FilterPipeline ─▶ ChunkRelay ─▶ POST /filter/apply ─▶ client
//! ```
//!
//! Decisions are cached in the [`warden_storage::PolicyStore`]; every
//! decision is appended to the [`warden_core::ActivityLog`].

pub mod api;
mod ca;
mod error;
pub mod flex;
pub mod flow;
pub mod gatekeeper;
mod handler;
pub mod pipeline;
mod proxy;
pub mod router;

#[cfg(test)]
mod testing;

pub use api::{HttpPolicyApi, PolicyApi};
pub use ca::{CaManager, CaManagerError};
pub use error::{ApiError, ProxyError, Result};
pub use flex::{FlexResolution, FlexRouting};
pub use flow::FlowContext;
pub use gatekeeper::{ConnectionGate, GateState, Gatekeeper, HandshakeReporter};
pub use handler::{into_response, WardenHandler};
pub use pipeline::{ChunkRelay, FilterPipeline};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use router::{RequestRouter, RouteOutcome, SyntheticResponse};

pub use warden_core::config::DEFAULT_PROXY_PORT;
