//! Reference counted sharded arrays with asynchronously delivered buffers.

pub mod array;
pub mod client;
pub mod config;
pub mod deferred;
pub mod device;
pub mod dtype;
pub mod shape;
pub mod sharding;
