//! Poolhouse
//!
//! A bounded, fair connection pool for async backend services.
//!
//! Many concurrent tasks share a small, elastic set of expensive backend
//! connections. [`Pool::acquire`] hands out an idle connection, opens a
//! new one while under [`Config::max_size`], or parks the caller in a
//! strict-FIFO queue until a connection is released to it or its
//! deadline passes. A background monitor keeps idle connections healthy
//! and the pool at its minimum size; [`Pool::shutdown`] drains in-use
//! connections with a grace period before closing up.
//!
//! Drivers plug in through the [`Connect`] trait; the pool treats
//! connections as opaque beyond open, probe, and close.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod config;
pub mod conn;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;
mod monitor;
pub mod pool;
mod slot;
mod waiters;

pub use self::config::{Config, ConfigError};
pub use self::conn::Connect;
pub use self::pool::{
    AcquireError, Lifecycle, Pool, PoolStatus, Pooled, ReleaseError, StartError,
};
pub use self::slot::ConnId;
