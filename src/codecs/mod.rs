//! Cache Codec Implementations
//!
//! Built-in implementations of the [`CacheCodec`](crate::traits::CacheCodec) trait.
//! Both cache tiers hold bytes; store payloads are `serde_json::Value`, so JSON
//! is the natural default.

mod json;
pub use json::JsonCodec;
