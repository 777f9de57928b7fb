//! Programmable fake upstream server for integration testing.
//!
//! This crate provides:
//! - **Fake upstream**: a listening endpoint with its own event loop thread that
//!   queues every accepted connection until a test claims it
//! - **Fake HTTP connections**: HTTP/1 and HTTP/2 server codecs that turn inbound
//!   bytes into [`upstream::FakeStream`]s a test can wait on and respond through
//! - **Fake raw connections**: byte accumulation with no protocol interpretation
//! - **Wait primitives**: [`synca::WaitableState`], the lock + condition pairing
//!   every blocking `wait_for_*` call is built on
//!
//! The event loop thread owns every live connection. Test threads never touch a
//! connection directly: they block on state the loop publishes, and anything that
//! mutates a connection is posted to the loop as a task.
//!
//! # Examples
//!
//! ```rust,no_run
//! use foundation_upstream::config::{HttpType, IpVersion, DEFAULT_WAIT_TIMEOUT};
//! use foundation_upstream::codec::HeaderMap;
//! use foundation_upstream::netloop::Dispatcher;
//! use foundation_upstream::upstream::FakeUpstream;
//!
//! let upstream = FakeUpstream::bind_tcp(0, HttpType::Http1, IpVersion::V4).unwrap();
//! let mut client = Dispatcher::new().unwrap();
//!
//! // ... point the system under test at upstream.local_address() ...
//!
//! let connection = upstream
//!     .wait_for_http_connection(&mut client, DEFAULT_WAIT_TIMEOUT)
//!     .unwrap();
//! let mut stream = connection
//!     .wait_for_new_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
//!     .unwrap();
//! stream
//!     .wait_for_end_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
//!     .unwrap();
//!
//! stream.encode_headers(HeaderMap::from_pairs([(":status", "200")]), false);
//! stream.encode_data(5, true);
//! ```
//!
//! # Features
//!
//! - `ssl-rustls` (default): accept TLS connections through `rustls`

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod config;
pub mod errors;
pub mod netloop;
pub mod stats;
pub mod synca;
pub mod upstream;

pub use config::{HttpType, IpVersion, ListenEndpoint, UpstreamConfig};
pub use errors::{UpstreamError, UpstreamResult};
pub use stats::IsolatedStats;
pub use upstream::{
    FakeConnection, FakeHttpConnection, FakeRawConnection, FakeStream, FakeUpstream,
};
