//! Flash Interface Layer (spec §4.6, §4.7): per-chip transaction
//! scheduling and the NAND command pipeline driven off it.

pub mod ecc;
pub mod nand;
pub mod pipeline;
pub mod scheduler;
pub mod zdma;
