//! Time-boxed, purpose-scoped access control for protected media.
//!
//! Anonymous clients get a short-lived session bound to their network
//! address, then fetch resources with signed capability tokens that name a
//! single resource and purpose. `policy::AccessPolicy` turns a request into
//! one allow/deny decision; `gateway::Gateway` wraps it in the calls a
//! transport layer exposes.

pub mod audit;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod policy;
pub mod ratelimit;
pub mod session;
pub mod token;

pub use clock::{Clock, ManualClock, RequestContext, SystemClock};
pub use config::Config;
pub use error::DenyReason;
pub use gateway::{FetchOutcome, Gateway};
pub use policy::{AccessDecision, AccessPolicy};
pub use token::Purpose;
