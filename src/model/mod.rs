// src/model/mod.rs

pub mod adapters;
pub mod context;
pub mod dsp;
pub mod placements;
