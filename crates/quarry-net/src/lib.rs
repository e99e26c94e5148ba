#![forbid(unsafe_code)]

//! # quarry-net
//!
//! HTTP transfer layer for the quarry artifact cache.
//!
//! The explicit public contract is the [`Net`] trait plus the concrete
//! [`HttpClient`]. Error classification lives on [`NetError`]: a status of
//! 404/410 means the artifact is confirmed absent upstream and must never be
//! retried, while 5xx-class and network-level failures are retryable.
//! Retry scheduling itself ([`RetryPolicy`]) is owned by the caller: this
//! crate classifies, it does not loop.

mod client;
mod error;
mod traits;
mod types;

pub use crate::{
    client::HttpClient,
    error::{NetError, NetResult},
    traits::{ByteStream, Net},
    types::{NetOptions, RetryPolicy},
};
