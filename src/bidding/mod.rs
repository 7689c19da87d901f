// src/bidding/mod.rs

pub mod dsp_client;
pub mod engine;

pub use dsp_client::{AuctionExecutor, AuctionOutcome, HttpAuctionExecutor};
pub use engine::AuctionEngine;
