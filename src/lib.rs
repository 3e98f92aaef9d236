//! Push-notification dispatch for Apple and Google Wallet loyalty passes.
//!
//! An approved [`model::PushRequest`] is resolved to its eligible passes
//! ([`resolver`]), fanned out in bounded batches ([`dispatch`]) through the
//! platform [`senders`], and its counts written back by [`lifecycle`].
//! [`sweep`] drives scheduled and queued requests from a periodic tick.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod resolver;
pub mod senders;
pub mod sweep;
