// src/model/context.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use crate::model::placements::PartnerConfig;
use crate::openrtb::request::BidRequest;

fn default_instant() -> Instant {
    Instant::now()
}

/// 单次请求的解析上下文
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestCtx {
    pub request_id: String,
    pub pub_id: i32,
    pub profile_id: i32,
    pub display_version: i32,
    /// site.domain 或 app.bundle
    pub source: String,
    /// 请求是否包含 pod（决定 VAST 标签的时长校验方式）
    pub is_pod_request: bool,
    /// 当前 profile 下的 partner 配置，key 为 partner_id
    pub partner_configs: HashMap<i32, PartnerConfig>,
    /// 请求开始时间，用于计算总耗时（不参与序列化）
    #[serde(skip, default = "default_instant")]
    pub start_time: Instant,
}

impl RequestCtx {
    pub fn from_request(request: &BidRequest, partner_configs: HashMap<i32, PartnerConfig>) -> Self {
        let wrapper = request.get_wrapper_detail();
        Self {
            request_id: request.id.clone(),
            pub_id: request.publisher_id().unwrap_or_default(),
            profile_id: wrapper.profileid,
            display_version: wrapper.versionid,
            source: request.source_name(),
            is_pod_request: false,
            partner_configs,
            start_time: Instant::now(),
        }
    }

    pub fn partner_by_bidder(&self, bidder_code: &str) -> Option<&PartnerConfig> {
        self.partner_configs
            .values()
            .filter(|p| p.bidder_code == bidder_code)
            .min_by_key(|p| p.partner_id)
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }
}
