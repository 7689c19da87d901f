// src/lib.rs

pub mod adpod;
pub mod api;
pub mod bidding;
pub mod config;
pub mod error;
pub mod feature;
pub mod logging;
pub mod model;
pub mod openrtb;
pub mod slot;
