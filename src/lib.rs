//! reverse-bin - an on-demand application launcher for reverse proxies
//!
//! This library turns an embeddable reverse-proxy engine into a
//! lambda-style launcher for backend processes:
//! - Spawns a backend child process when the first matching request arrives
//! - Gates dispatch on a readiness probe (HTTP polling or Unix-socket existence)
//! - Proxies over TCP loopback or Unix domain sockets via the host's engine
//! - Terminates idle backends after a configurable timeout and respawns on demand
//! - Recovers from backend crashes with a liveness check before every dispatch
//! - Optionally runs a detector program per request to compute launch
//!   parameters dynamically, enabling multi-tenant setups
//!
//! The host supplies the proxying itself and a request-scoped placeholder
//! expander; this crate supplies the supervision. Wire it up through
//! [`ReverseBin::select_upstream`] (upstream source) and
//! [`ReverseBin::begin_request`] (request accounting).

pub mod config;
pub mod detector;
pub mod error;
pub mod expand;
pub mod handler;
pub mod process;
pub mod readiness;
pub mod upstream;

pub use config::HandlerConfig;
pub use detector::{DetectorOverrides, LaunchParams};
pub use error::Error;
pub use expand::{Expander, ExpanderFn, NoopExpander};
pub use handler::{RequestGuard, ReverseBin, SlotStatus};
pub use upstream::Upstream;
