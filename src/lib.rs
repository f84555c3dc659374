//! Resource manager client core
//!
//! The request pipeline, long-running operation polling, bearer token
//! caching and on-demand resource provider registration shared by every
//! resource manager API client.
//!
//! # Module Structure
//!
//! - [`context`] - cancellation and deadlines
//! - [`http`] - request/response model, pipeline, transport and retries
//! - [`auth`] - credentials and the bearer token policy
//! - [`lro`] - polling strategies, the poller and resume tokens
//! - [`registration`] - provider registration client and policy
//! - [`client`] - [`ArmClient`], the assembled pipeline

pub mod auth;
pub mod client;
pub mod context;
pub mod error;
pub mod http;
pub mod lro;
pub mod registration;

pub use client::{ArmClient, ClientOptions};
pub use context::Context;
pub use error::{Error, ResponseError, Result};
pub use lro::{FinalResponse, FinalStateVia, OperationStatus, Poller};
