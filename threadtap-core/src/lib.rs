//! Core engine for threadtap: capture correlation, request replay, and a
//! provider-agnostic chat agent over the collected threads.
//!
//! The crate is organized around three flows:
//!
//! - **Capture** ([`capture`]): an observation tap publishes body and
//!   header halves of observed browser requests onto a typed bus; the
//!   correlator pairs them into replayable [`capture::template::RequestTemplate`]s
//!   and picks up the session header value along the way.
//! - **Replay** ([`replay`]): a captured search template is re-sent with a
//!   substituted query, each result id is fetched through the detail
//!   template with pacing between requests, and per-item failures are
//!   aggregated instead of aborting the run.
//! - **Chat** ([`agent`], [`llm`]): a tool-looped conversation over the
//!   collected corpus, with OpenAI, Anthropic, and Ollama backends behind
//!   one [`llm::Provider`] trait.
//!
//! [`service::ThreadtapService`] ties the flows together and is what the
//! CLI drives; everything underneath is usable on its own.

pub mod agent;
pub mod capture;
pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod model;
pub mod replay;
pub mod service;
pub mod session;
pub mod state;
pub mod testing;

pub use config::{ThreadtapConfig, load_config};
pub use error::{CoreError, ProviderError, TransportError};
pub use model::{Comment, SearchResult, Thread};
pub use service::ThreadtapService;
