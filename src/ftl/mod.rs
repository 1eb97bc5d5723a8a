//! Flash Translation Layer (spec §4.2–§4.5): block allocation, address
//! mapping, the data cache, and the request pipeline that ties them
//! together.

pub mod block_manager;
pub mod data_cache;
pub mod mapping;
pub mod namespace;
pub mod pipeline;
