// src/logging/mod.rs

pub mod adx_log;
pub mod runtime_logger;

pub use adx_log::PodAuctionLog;
pub use runtime_logger::RuntimeLogger;
