// src/bidding/engine.rs

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adpod::pod::AdPodSet;
use crate::adpod::response;
use crate::bidding::dsp_client::{AuctionExecutor, BidderNonBid};
use crate::config::ConfigManager;
use crate::error::AdxError;
use crate::feature::random::{RandomSource, ThreadRandom};
use crate::feature::FeatureCache;
use crate::logging::{PodAuctionLog, RuntimeLogger};
use crate::model::adapters::ConfigStore;
use crate::model::context::RequestCtx;
use crate::model::placements::{PartnerConfig, VastTag};
use crate::openrtb::request::{BidRequest, Imp};
use crate::openrtb::response::BidResponse;
use crate::slot::{SlotResolver, VastDurationBounds};

/// CTV 竞价流水线：pod 归类 → 展示机会生成 → bidder 参数解析 → 扇出竞价 → 排除与选择 → 响应组装
pub struct AuctionEngine {
    config: Arc<ConfigManager>,
    store: Arc<dyn ConfigStore>,
    features: Arc<FeatureCache>,
    executor: Arc<dyn AuctionExecutor>,
    resolver: SlotResolver,
    rng: Arc<dyn RandomSource>,
    runtime_logger: Option<Arc<RuntimeLogger>>,
}

impl AuctionEngine {
    pub fn new(
        config: Arc<ConfigManager>,
        store: Arc<dyn ConfigStore>,
        features: Arc<FeatureCache>,
        executor: Arc<dyn AuctionExecutor>,
    ) -> Self {
        Self {
            config,
            store,
            features,
            executor,
            resolver: SlotResolver::new(),
            rng: Arc::new(ThreadRandom),
            runtime_logger: None,
        }
    }

    pub fn with_runtime_logger(mut self, logger: Arc<RuntimeLogger>) -> Self {
        self.runtime_logger = Some(logger);
        self
    }

    pub fn with_random(mut self, rng: Arc<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_resolver(mut self, resolver: SlotResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn resolver(&self) -> &SlotResolver {
        &self.resolver
    }

    /// 处理一次竞价请求。pod 扩展格式错误等请求级错误直接返回，
    /// 单个 pod 的错误写入响应扩展。
    pub async fn process_bid_request(&self, request: BidRequest) -> Result<BidResponse, AdxError> {
        if request.imp.is_empty() {
            return Ok(BidResponse::empty(&request.id));
        }

        let mut pods = AdPodSet::classify(&request)?;
        let mut ctx = RequestCtx::from_request(&request, HashMap::new());
        ctx.is_pod_request = !pods.is_empty();
        ctx.partner_configs = match self
            .store
            .partner_configs(ctx.pub_id, ctx.profile_id, ctx.display_version)
            .await
        {
            Ok(configs) => configs,
            Err(e) => {
                warn!(request_id = %ctx.request_id, pub_id = ctx.pub_id, error = %e, "partner configuration unavailable");
                HashMap::new()
            }
        };

        pods.generate_impressions(self.config.multiple_of());
        let mut outgoing = request.clone();
        outgoing.imp = pods.outgoing_imps(&request);
        if outgoing.imp.is_empty() {
            debug!(request_id = %ctx.request_id, "no impressions left to auction");
            return Ok(response::assemble(&request.id, Vec::new(), &pods));
        }

        self.attach_bidder_params(&ctx, &pods, &mut outgoing.imp).await;
        pods.filter_vast_tags(&mut outgoing.imp);

        let deadline = self.config.deadline(request.tmax);
        let outcome = self.executor.execute(&outgoing, deadline).await?;

        let mut plain_bids = Vec::new();
        for (seat, bid) in outcome.seat_bids() {
            if let Some(bid) = pods.collect_bid(bid, &seat) {
                plain_bids.push((seat, bid));
            }
        }
        let plain_count = plain_bids.len();
        pods.perform_auction_and_exclusion(self.rng.as_ref());

        let mut response = response::assemble(&request.id, plain_bids, &pods);
        if !response.seatbid.is_empty() {
            response.bidid = Some(Uuid::new_v4().to_string());
        }
        self.apply_fsc(&ctx, &mut response);
        attach_bidder_non_bids(&mut response, outcome.non_bids());

        let mut log = PodAuctionLog::new(&ctx.request_id, ctx.pub_id, ctx.profile_id);
        for pod in &pods.pods {
            log.add_pod(pod);
        }
        for call in &outcome.calls {
            log.add_bidder_call(call);
        }
        log.finish(plain_count, ctx.elapsed_ms());
        info!(
            request_id = %ctx.request_id,
            pods = pods.pods.len(),
            status = %log.status,
            elapsed_ms = log.elapsed_ms,
            "ctv auction complete"
        );
        self.write_auction_log(&ctx, &log).await;

        Ok(response)
    }

    /// 为每个 partner 解析每个展示机会的 bidder 参数，解析失败只跳过该组合
    async fn attach_bidder_params(&self, ctx: &RequestCtx, pods: &AdPodSet, imps: &mut [Imp]) {
        let mut partners: Vec<&PartnerConfig> = ctx.partner_configs.values().collect();
        partners.sort_by_key(|p| p.partner_id);
        let mut vast_tags: Option<HashMap<i32, VastTag>> = None;
        // 正则命中的 hash 在所有 partner 解析完后才写回 tagid，避免改变后续 partner 的候选 key
        let mut matched_tag_ids: Vec<Option<String>> = vec![None; imps.len()];

        for partner in partners {
            let mappings = match self
                .store
                .slot_mappings(ctx.pub_id, ctx.profile_id, ctx.display_version, partner.partner_id)
                .await
            {
                Ok(mappings) => mappings,
                Err(e) => {
                    warn!(partner_id = partner.partner_id, error = %e, "slot mappings unavailable");
                    continue;
                }
            };

            if partner.is_vast_bidder() {
                if vast_tags.is_none() {
                    vast_tags = Some(self.store.vast_tags(ctx.pub_id).await.unwrap_or_else(|e| {
                        warn!(pub_id = ctx.pub_id, error = %e, "vast tag catalogue unavailable");
                        HashMap::new()
                    }));
                }
                let Some(tags) = vast_tags.as_ref() else {
                    continue;
                };
                for imp in imps.iter_mut() {
                    let bounds = vast_bounds(pods, imp);
                    match self.resolver.resolve_vast(ctx, partner.partner_id, imp, &mappings, tags, &bounds) {
                        Ok(Some(resolved)) => imp.set_bidder_params(&partner.bidder_code, resolved.params),
                        Ok(None) => {}
                        Err(e) => debug!(imp_id = %imp.id, partner_id = partner.partner_id, error = %e, "vast tags rejected"),
                    }
                }
                continue;
            }

            for (imp, tag_id) in imps.iter_mut().zip(matched_tag_ids.iter_mut()) {
                match self.resolver.resolve(ctx, partner.partner_id, imp, &mappings) {
                    Ok(resolved) => {
                        if tag_id.is_none() {
                            *tag_id = resolved.tag_id;
                        }
                        imp.set_bidder_params(&partner.bidder_code, Value::Object(resolved.params));
                    }
                    Err(e) => warn!(imp_id = %imp.id, partner_id = partner.partner_id, error = %e, "slot resolution failed"),
                }
            }
        }

        for (imp, tag_id) in imps.iter_mut().zip(matched_tag_ids) {
            if let Some(hash) = tag_id {
                imp.tagid = Some(hash);
            }
        }
    }

    /// 对开启 FSC 的 DSP 的 bid 打上标记。DSP id 取自 bid 扩展，缺省时用 partner id
    fn apply_fsc(&self, ctx: &RequestCtx, response: &mut BidResponse) {
        for seatbid in &mut response.seatbid {
            let Some(partner) = seatbid.seat.as_deref().and_then(|seat| ctx.partner_by_bidder(seat)) else {
                continue;
            };
            for bid in &mut seatbid.bid {
                let dsp_id = bid.dsp_id().unwrap_or(partner.partner_id);
                if self.features.is_fsc_applicable(ctx.pub_id, dsp_id) {
                    bid.set_ext_field("fsc", json!(1));
                }
            }
        }
    }

    async fn write_auction_log(&self, ctx: &RequestCtx, log: &PodAuctionLog) {
        let Some(logger) = &self.runtime_logger else {
            return;
        };
        let (logger_throttled, _) = self.features.is_analytics_throttled(ctx.pub_id, ctx.profile_id);
        if logger_throttled {
            return;
        }
        match serde_json::to_string(log) {
            Ok(line) => logger.log("INFO", &line).await,
            Err(e) => warn!(request_id = %ctx.request_id, error = %e, "failed to encode auction log"),
        }
    }
}

/// 生成的展示机会使用 slot 区间与 pod 总时长；普通 video 使用自身的 min/maxduration
fn vast_bounds(pods: &AdPodSet, imp: &Imp) -> VastDurationBounds {
    if let Some((pod, generated)) = pods.impression(&imp.id) {
        return VastDurationBounds {
            min_duration: generated.min_duration,
            max_duration: generated.max_duration,
            pod_duration: pod.duration_bounds().1,
        };
    }
    let video = imp.video.as_ref();
    VastDurationBounds {
        min_duration: video.and_then(|v| v.minduration).unwrap_or(0),
        max_duration: video.and_then(|v| v.maxduration).unwrap_or(0),
        pod_duration: 0,
    }
}

/// 执行器层面的失败 bidder 记入 `ext.seatnonbid`
fn attach_bidder_non_bids(response: &mut BidResponse, non_bids: Vec<BidderNonBid>) {
    if non_bids.is_empty() {
        return;
    }
    let entries: Vec<Value> = non_bids
        .into_iter()
        .map(|n| json!({"seat": n.bidder, "statuscode": n.code}))
        .collect();
    let ext = response.ext.get_or_insert_with(|| json!({}));
    if let Value::Object(map) = ext {
        map.insert("seatnonbid".to_string(), Value::Array(entries));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bidding::dsp_client::{AuctionOutcome, BidderCall, CallStatus};
    use crate::config::AppConfig;
    use crate::error::AuctionError;
    use crate::feature::random::FixedRandom;
    use crate::model::adapters::{MemoryConfigStore, PartnerRow, ScopedSlotMappingRow, StoreData};
    use crate::model::placements::{SlotMappingRow, REGEX_KGP};
    use crate::openrtb::response::{Bid, SeatBid};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// 按 imp 出价的桩执行器，并记录收到的请求
    struct StubExecutor {
        seen: Mutex<Vec<BidRequest>>,
        bids: Vec<(String, &'static str, f64, i64, &'static str)>,
        bid_ext: Option<Value>,
        cancel: bool,
    }

    #[async_trait]
    impl AuctionExecutor for StubExecutor {
        async fn execute(&self, request: &BidRequest, _deadline: Duration) -> Result<AuctionOutcome, AuctionError> {
            self.seen.lock().push(request.clone());
            if self.cancel {
                return Err(AuctionError::Cancelled { deadline_ms: 10 });
            }
            let mut outcome = AuctionOutcome::default();
            for (impid, id, price, dur, domain) in &self.bids {
                let bid = Bid {
                    id: id.to_string(),
                    impid: impid.clone(),
                    price: *price,
                    dur: Some(*dur),
                    adomain: vec![domain.to_string()],
                    ext: self.bid_ext.clone(),
                    ..Default::default()
                };
                outcome.responses.push((
                    "pubmatic".to_string(),
                    BidResponse {
                        id: request.id.clone(),
                        seatbid: vec![SeatBid { bid: vec![bid], seat: Some("pubmatic".to_string()), group: None }],
                        ..Default::default()
                    },
                ));
            }
            outcome.calls.push(BidderCall {
                bidder: "spotx".to_string(),
                url: "http://localhost/bid".to_string(),
                status: CallStatus::Timeout,
                elapsed_ms: 10,
                bids: 0,
                max_price: 0.0,
            });
            Ok(outcome)
        }
    }

    fn partner(partner_id: i32, bidder_code: &str, key_gen_pattern: &str) -> PartnerRow {
        PartnerRow {
            pub_id: 5890,
            profile_id: 123,
            version_id: 1,
            config: PartnerConfig {
                partner_id,
                bidder_code: bidder_code.to_string(),
                adapter_id: 1,
                key_gen_pattern: key_gen_pattern.to_string(),
                timeout_ms: None,
                extra: HashMap::new(),
            },
        }
    }

    fn mapping(partner_id: i32, slot_name: &str, mapping_json: &str, hash: &str) -> ScopedSlotMappingRow {
        ScopedSlotMappingRow {
            pub_id: 5890,
            profile_id: 123,
            row: SlotMappingRow {
                partner_id,
                adapter_id: 1,
                version_id: 1,
                slot_name: slot_name.to_string(),
                mapping_json: mapping_json.to_string(),
                order_id: 0,
                hash: hash.to_string(),
            },
        }
    }

    fn store_data() -> StoreData {
        StoreData {
            partners: vec![partner(10, "pubmatic", "_AU_@_W_x_H_")],
            slot_mappings: vec![mapping(10, "/15671365/CTV@0x0", r#"{"siteId": "77"}"#, "")],
            ..Default::default()
        }
    }

    fn engine_with(executor: Arc<StubExecutor>, data: StoreData) -> (AuctionEngine, Arc<FeatureCache>) {
        let store = Arc::new(MemoryConfigStore::new(data));
        let features = Arc::new(FeatureCache::with_random(
            store.clone(),
            Duration::from_secs(60),
            "",
            Arc::new(FixedRandom(0)),
        ));
        let engine = AuctionEngine::new(Arc::new(ConfigManager::new(AppConfig::default())), store, features.clone(), executor)
            .with_random(Arc::new(FixedRandom(0)));
        (engine, features)
    }

    fn engine(executor: Arc<StubExecutor>) -> AuctionEngine {
        engine_with(executor, store_data()).0
    }

    fn pod_request() -> BidRequest {
        serde_json::from_value(json!({
            "id": "req-1",
            "site": {"domain": "ctv.example", "publisher": {"id": "5890"}},
            "ext": {"wrapper": {"profileid": 123, "versionid": 1}},
            "imp": [{"id": "imp1", "tagid": "/15671365/ctv", "video": {"minduration": 0, "maxduration": 40,
                "ext": {"adpod": {"minads": 1, "maxads": 2, "minduration": 10, "maxduration": 30}}}}]
        }))
        .unwrap()
    }

    fn stub(bids: Vec<(&str, &'static str, f64, i64, &'static str)>) -> Arc<StubExecutor> {
        Arc::new(StubExecutor {
            seen: Mutex::new(Vec::new()),
            bids: bids.into_iter().map(|(i, id, p, d, a)| (i.to_string(), id, p, d, a)).collect(),
            bid_ext: None,
            cancel: false,
        })
    }

    #[tokio::test]
    async fn pod_request_is_expanded_resolved_and_selected() {
        let executor = stub(vec![
            ("imp1::imp1::1", "b1", 5.0, 15, "a.com"),
            ("imp1::imp1::2", "b2", 4.0, 20, "b.com"),
        ]);
        let response = engine(executor.clone()).process_bid_request(pod_request()).await.unwrap();

        let sent = executor.seen.lock()[0].clone();
        let ids: Vec<&str> = sent.imp.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["imp1::imp1::1", "imp1::imp1::2"]);
        let params = sent.imp[0].bidder_params("pubmatic").unwrap();
        assert_eq!(params["adSlot"], json!("/15671365/CTV@0x0"));
        assert_eq!(params["siteId"], json!("77"));

        let ext = response.ext.unwrap();
        assert_eq!(ext["adpod"]["imp1"]["selected"], json!(["b1", "b2"]));
        assert_eq!(ext["seatnonbid"][0], json!({"seat": "spotx", "statuscode": 101}));
    }

    #[tokio::test]
    async fn malformed_pod_extension_aborts_before_auction() {
        let executor = stub(vec![]);
        let mut request = pod_request();
        request.imp[0].video.as_mut().unwrap().ext = Some(json!({"adpod": {"minads": "two"}}));

        let err = engine(executor.clone()).process_bid_request(request).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert!(executor.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn cancelled_auction_is_an_error() {
        let executor = Arc::new(StubExecutor { seen: Mutex::new(Vec::new()), bids: vec![], bid_ext: None, cancel: true });
        let err = engine(executor).process_bid_request(pod_request()).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn empty_imp_list_returns_an_empty_response() {
        let executor = stub(vec![]);
        let request: BidRequest = serde_json::from_value(json!({"id": "req-2", "imp": []})).unwrap();
        let response = engine(executor.clone()).process_bid_request(request).await.unwrap();
        assert!(response.seatbid.is_empty());
        assert!(executor.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn regex_match_hash_becomes_the_outgoing_tagid() {
        let executor = stub(vec![]);
        let mut data = store_data();
        data.partners.push(partner(20, "appnexus", REGEX_KGP));
        data.slot_mappings.push(mapping(20, "^/15671365/.*@.*@0x0$", r#"{"placementId": 9}"#, "HASH123"));
        let (engine, _) = engine_with(executor.clone(), data);
        engine.process_bid_request(pod_request()).await.unwrap();

        let sent = executor.seen.lock()[0].clone();
        for imp in &sent.imp {
            assert_eq!(imp.tagid.as_deref(), Some("HASH123"));
            assert_eq!(imp.bidder_params("appnexus").unwrap()["adSlot"], json!("HASH123"));
            // 低 partner id 的 key 仍按原始 tagid 生成
            assert_eq!(imp.bidder_params("pubmatic").unwrap()["adSlot"], json!("/15671365/CTV@0x0"));
        }
    }

    #[tokio::test]
    async fn exact_match_leaves_tagid_untouched() {
        let executor = stub(vec![]);
        engine(executor.clone()).process_bid_request(pod_request()).await.unwrap();
        let sent = executor.seen.lock()[0].clone();
        assert_eq!(sent.imp[0].tagid.as_deref(), Some("/15671365/ctv"));
    }

    #[tokio::test]
    async fn fsc_uses_the_dsp_id_from_the_bid() {
        let data = StoreData { fsc_thresholds: HashMap::from([(6, 100)]), ..store_data() };
        let bids = vec![("imp1::imp1::1", "b1", 5.0, 15, "a.com")];

        let executor = Arc::new(StubExecutor {
            seen: Mutex::new(Vec::new()),
            bids: bids.iter().map(|(i, id, p, d, a)| (i.to_string(), *id, *p, *d, *a)).collect(),
            bid_ext: Some(json!({"dspid": 6})),
            cancel: false,
        });
        let (engine, features) = engine_with(executor, data.clone());
        assert!(features.refresh().await.is_ok());
        let response = engine.process_bid_request(pod_request()).await.unwrap();
        assert_eq!(response.seatbid[0].bid[0].ext.as_ref().unwrap()["fsc"], json!(1));

        // 没有 dspid 时回落到 partner id 10，未配置阈值
        let (engine, features) = engine_with(stub(bids), data);
        assert!(features.refresh().await.is_ok());
        let response = engine.process_bid_request(pod_request()).await.unwrap();
        let ext = response.seatbid[0].bid[0].ext.clone().unwrap_or_default();
        assert!(ext.get("fsc").is_none());
    }
}
