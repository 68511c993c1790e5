//! Wire protocols used to probe proxies and echo services.
//!
//! This module contains:
//! - HTTP: request builder and streaming response codec
//! - SOCKS5: client handshake, CONNECT and UDP ASSOCIATE

pub mod http;
pub mod socks5;

pub use http::{DirectFetcher, Fetcher, HttpCodec, HttpRequest, HttpResponse, HttpUrl};
pub use socks5::{TargetAddr, UdpAssociate};
