//! Computational SSD controller firmware core: FTL, FIL, NVMe front-end,
//! and the ring-queue transport tying subsystems together, modeled as a
//! host-testable `std` library rather than the bare-metal kernel this
//! crate started life as.

pub mod address;
pub mod config;
pub mod device;
pub mod error;
pub mod fil;
pub mod ftl;
pub mod logging;
pub mod nvme;
pub mod persist;
pub mod ring;
pub mod txn;
pub mod worker;
