// src/adpod/mod.rs

pub mod exclusion;
pub mod ext;
pub mod impid;
pub mod impressions;
pub mod pod;
pub mod response;
pub mod tag_filter;

pub use exclusion::{CandidateBid, LossReason, WinningSelection};
pub use ext::{AdPodExt, DynamicPodConfig, ExclusionConfig};
pub use pod::{AdPodContext, AdPodSet, GeneratedImpression, PodKind};
