// src/adpod/pod.rs

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::adpod::exclusion::{
    meets_minimum_fill, select_dynamic, select_structured, withdraw_winners, CandidateBid, SlotDuration,
    WinningSelection,
};
use crate::adpod::ext::{AdPodExt, DynamicPodConfig, ExclusionConfig};
use crate::adpod::impid;
use crate::adpod::impressions;
use crate::adpod::tag_filter::{filter_vast_tags, merge_blocked, BlockedTags};
use crate::error::PodError;
use crate::feature::random::RandomSource;
use crate::openrtb::request::{BidRequest, Imp, Video};
use crate::openrtb::response::Bid;

/// 结构化 pod 中调用方声明的一个 slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredSlot {
    pub imp_id: String,
    pub min_duration: i64,
    pub max_duration: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PodKind {
    Dynamic(DynamicPodConfig),
    Structured {
        slots: Vec<StructuredSlot>,
        exclusion: ExclusionConfig,
    },
}

impl PodKind {
    pub fn name(&self) -> &'static str {
        match self {
            PodKind::Dynamic(_) => "dynamic",
            PodKind::Structured { .. } => "structured",
        }
    }
}

/// 从 pod 派生出的单个展示机会
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedImpression {
    pub id: String,
    pub original_imp_id: String,
    pub pod_id: String,
    pub sequence: usize,
    pub min_duration: i64,
    pub max_duration: i64,
}

impl GeneratedImpression {
    fn new(original_imp_id: &str, pod_id: &str, sequence: usize, min_duration: i64, max_duration: i64) -> Self {
        Self {
            id: impid::encode(original_imp_id, pod_id, sequence),
            original_imp_id: original_imp_id.to_string(),
            pod_id: pod_id.to_string(),
            sequence,
            min_duration,
            max_duration,
        }
    }

    fn slot_duration(&self) -> SlotDuration {
        SlotDuration {
            sequence: self.sequence,
            min_duration: self.min_duration,
            max_duration: self.max_duration,
        }
    }

    /// 复制原始展示机会，写入本 slot 的时长与序号并去掉 pod 扩展
    pub fn to_imp(&self, original: &Imp) -> Imp {
        let mut imp = original.clone();
        imp.id = self.id.clone();
        if let Some(video) = imp.video.as_mut() {
            video.minduration = Some(self.min_duration);
            video.maxduration = Some(self.max_duration);
            video.sequence = Some(self.sequence as i64);
            video.maxextended = None;
            video.poddur = None;
            video.maxseq = None;
            video.rqddurs = None;
            strip_pod_ext(video);
        }
        imp
    }
}

fn strip_pod_ext(video: &mut Video) {
    if let Some(Value::Object(ext)) = video.ext.as_mut() {
        ext.remove("adpod");
        ext.remove("offset");
        if ext.is_empty() {
            video.ext = None;
        }
    }
}

/// 单个广告时段（ad break）的上下文，请求结束即释放
#[derive(Debug, Clone)]
pub struct AdPodContext {
    pub pod_id: String,
    pub kind: PodKind,
    /// 组成该 pod 的原始 imp id
    pub imp_ids: Vec<String>,
    pub impressions: Vec<GeneratedImpression>,
    pub candidates: Vec<CandidateBid>,
    pub selection: WinningSelection,
    pub blocked_tags: BlockedTags,
    pub error: Option<PodError>,
}

impl AdPodContext {
    fn new(pod_id: String, kind: PodKind, imp_id: &str) -> Self {
        Self {
            pod_id,
            kind,
            imp_ids: vec![imp_id.to_string()],
            impressions: Vec::new(),
            candidates: Vec::new(),
            selection: WinningSelection::default(),
            blocked_tags: BlockedTags::new(),
            error: None,
        }
    }

    /// 响应扩展中报告的 pod 时长区间
    pub fn duration_bounds(&self) -> (i64, i64) {
        match &self.kind {
            PodKind::Dynamic(config) => (config.pod_min_duration, config.pod_max_duration),
            PodKind::Structured { slots, .. } => (
                slots.iter().map(|s| s.min_duration).sum(),
                slots.iter().map(|s| s.max_duration).sum(),
            ),
        }
    }

    pub fn generate_impressions(&mut self, multiple_of: i64) {
        self.impressions.clear();
        match &self.kind {
            PodKind::Dynamic(config) => {
                if let Err(e) = config.validate() {
                    warn!(pod_id = %self.pod_id, error = %e, "adpod constraint violation");
                    self.error = Some(e);
                    return;
                }
                let imp_id = &self.imp_ids[0];
                self.impressions = impressions::generate(config, multiple_of)
                    .into_iter()
                    .enumerate()
                    .map(|(i, (min, max))| GeneratedImpression::new(imp_id, &self.pod_id, i + 1, min, max))
                    .collect();
            }
            PodKind::Structured { slots, .. } => {
                if let Some(slot) = slots.iter().find(|s| s.max_duration <= 0 || s.min_duration > s.max_duration) {
                    self.error = Some(PodError::Constraint(format!(
                        "imp {} has an invalid slot duration range [{}, {}]",
                        slot.imp_id, slot.min_duration, slot.max_duration
                    )));
                    return;
                }
                self.impressions = slots
                    .iter()
                    .enumerate()
                    .map(|(i, slot)| {
                        GeneratedImpression::new(&slot.imp_id, &self.pod_id, i + 1, slot.min_duration, slot.max_duration)
                    })
                    .collect();
            }
        }

        if self.impressions.is_empty() {
            self.error = Some(PodError::ImpressionGeneration { pod_id: self.pod_id.clone() });
        }
    }

    pub fn perform_auction_and_exclusion(&mut self, rng: &dyn RandomSource) {
        if self.error.is_some() {
            return;
        }
        let slots: Vec<SlotDuration> = self.impressions.iter().map(GeneratedImpression::slot_duration).collect();
        let candidates = std::mem::take(&mut self.candidates);

        self.selection = match &self.kind {
            PodKind::Dynamic(config) => {
                let mut selection = select_dynamic(candidates, config, &slots, rng);
                if !meets_minimum_fill(&selection, config) {
                    let reason = format!(
                        "selected {} ads totalling {}s, need at least {} ads and {}s",
                        selection.winners.len(),
                        selection.total_duration,
                        config.min_ads,
                        config.pod_min_duration
                    );
                    withdraw_winners(&mut selection);
                    self.error = Some(PodError::Selection { pod_id: self.pod_id.clone(), reason });
                }
                selection
            }
            PodKind::Structured { exclusion, .. } => select_structured(candidates, &slots, exclusion, rng),
        };

        debug!(
            pod_id = %self.pod_id,
            winners = self.selection.winners.len(),
            losers = self.selection.losers.len(),
            total_duration = self.selection.total_duration,
            "adpod auction complete"
        );
    }
}

/// 一次请求中的全部 pod
#[derive(Debug, Clone, Default)]
pub struct AdPodSet {
    pub pods: Vec<AdPodContext>,
    arrival: usize,
}

impl AdPodSet {
    /// 把每个 video 展示机会归类为动态 pod、结构化 pod 或普通 video。
    /// pod 扩展 JSON 格式错误或 pod id 非法时整个请求失败。
    pub fn classify(request: &BidRequest) -> Result<Self, PodError> {
        let request_ext = request
            .adpod_ext_raw()
            .map(|raw| AdPodExt::parse(raw, "request"))
            .transpose()?;
        let base = request_ext.clone().unwrap_or_default();

        let mut pods: Vec<AdPodContext> = Vec::new();
        let mut structured: HashMap<String, usize> = HashMap::new();

        for imp in &request.imp {
            let Some(video) = &imp.video else {
                continue;
            };
            let imp_ext = imp
                .video_adpod_ext_raw()
                .map(|raw| AdPodExt::parse(raw, &imp.id))
                .transpose()?;
            let pod_min = video.minduration.unwrap_or(0);
            let pod_max = video.maxduration.unwrap_or(0);

            if let Some(ext) = imp_ext {
                impid::validate_pod_id(&imp.id)?;
                let config = DynamicPodConfig::resolve(&ext.merge_over(&base), pod_min, pod_max);
                pods.push(AdPodContext::new(imp.id.clone(), PodKind::Dynamic(config), &imp.id));
                continue;
            }

            if let Some(pod_id) = video.podid.as_deref().filter(|id| !id.is_empty()) {
                impid::validate_pod_id(pod_id)?;
                match video.poddur.filter(|d| *d > 0) {
                    Some(poddur) => {
                        // ORTB 2.6 动态 pod：poddur 为总时长，min/maxduration 为单个广告时长
                        let legacy = AdPodExt {
                            maxads: video.maxseq.filter(|n| *n > 0),
                            minduration: video.minduration,
                            maxduration: video.maxduration,
                            ..Default::default()
                        };
                        let config = DynamicPodConfig::resolve(&legacy.merge_over(&base), 0, poddur);
                        pods.push(AdPodContext::new(pod_id.to_string(), PodKind::Dynamic(config), &imp.id));
                    }
                    None => {
                        let slots = structured_slots(imp, video);
                        match structured.get(pod_id) {
                            Some(&index) => {
                                let pod = &mut pods[index];
                                pod.imp_ids.push(imp.id.clone());
                                if let PodKind::Structured { slots: existing, .. } = &mut pod.kind {
                                    existing.extend(slots);
                                }
                            }
                            None => {
                                structured.insert(pod_id.to_string(), pods.len());
                                let kind = PodKind::Structured { slots, exclusion: base.exclusion() };
                                pods.push(AdPodContext::new(pod_id.to_string(), kind, &imp.id));
                            }
                        }
                    }
                }
                continue;
            }

            if request_ext.is_some() {
                impid::validate_pod_id(&imp.id)?;
                let config = DynamicPodConfig::resolve(&base, pod_min, pod_max);
                pods.push(AdPodContext::new(imp.id.clone(), PodKind::Dynamic(config), &imp.id));
            }
        }

        Ok(Self { pods, arrival: 0 })
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn pod(&self, pod_id: &str) -> Option<&AdPodContext> {
        self.pods.iter().find(|p| p.pod_id == pod_id)
    }

    /// 按生成的展示机会 ID 查找所属 pod 与展示机会
    pub fn impression(&self, generated_id: &str) -> Option<(&AdPodContext, &GeneratedImpression)> {
        let decoded = impid::decode(generated_id)?;
        let pod = self.pod(&decoded.pod_id)?;
        let generated = pod
            .impressions
            .iter()
            .find(|g| g.sequence == decoded.sequence && g.original_imp_id == decoded.original_imp_id)?;
        Some((pod, generated))
    }

    pub fn generate_impressions(&mut self, multiple_of: i64) {
        for pod in &mut self.pods {
            pod.generate_impressions(multiple_of);
        }
    }

    /// 下发给竞价执行器的展示机会：普通展示机会原样保留，
    /// pod 展示机会替换为生成的展示机会（生成失败的 pod 不下发）
    pub fn outgoing_imps(&self, request: &BidRequest) -> Vec<Imp> {
        let mut imps = Vec::new();
        for imp in &request.imp {
            let owners: Vec<&AdPodContext> = self
                .pods
                .iter()
                .filter(|p| p.imp_ids.iter().any(|id| id == &imp.id))
                .collect();
            if owners.is_empty() {
                imps.push(imp.clone());
                continue;
            }
            for pod in owners {
                if pod.error.is_some() {
                    continue;
                }
                imps.extend(
                    pod.impressions
                        .iter()
                        .filter(|g| g.original_imp_id == imp.id)
                        .map(|g| g.to_imp(imp)),
                );
            }
        }
        imps
    }

    fn impression_mut(&mut self, generated_id: &str) -> Option<(&mut AdPodContext, GeneratedImpression)> {
        let decoded = impid::decode(generated_id)?;
        let pod = self.pods.iter_mut().find(|p| p.pod_id == decoded.pod_id)?;
        let generated = pod
            .impressions
            .iter()
            .find(|g| g.sequence == decoded.sequence && g.original_imp_id == decoded.original_imp_id)?
            .clone();
        Some((pod, generated))
    }

    /// 对生成的展示机会做基于时长的 VAST 标签过滤，并按 pod 记录被过滤的标签
    pub fn filter_vast_tags(&mut self, imps: &mut [Imp]) {
        for imp in imps.iter_mut() {
            let Some((pod, generated)) = self.impression_mut(&imp.id) else {
                continue;
            };
            let blocked = filter_vast_tags(imp, generated.min_duration, generated.max_duration);
            merge_blocked(&mut pod.blocked_tags, blocked);
        }
    }

    /// 能解码到已知 pod 的 bid 收入该 pod；否则作为普通 video bid 原样返回
    pub fn collect_bid(&mut self, bid: Bid, seat: &str) -> Option<Bid> {
        let arrival = self.arrival;
        let Some((pod, generated)) = self.impression_mut(&bid.impid) else {
            return Some(bid);
        };
        pod.candidates.push(CandidateBid {
            seat: seat.to_string(),
            original_imp_id: generated.original_imp_id,
            pod_id: generated.pod_id,
            sequence: generated.sequence,
            arrival,
            duration: 0,
            bid,
        });
        self.arrival += 1;
        None
    }

    /// 竞价全部返回之后调用；各 pod 相互独立
    pub fn perform_auction_and_exclusion(&mut self, rng: &dyn RandomSource) {
        for pod in &mut self.pods {
            pod.perform_auction_and_exclusion(rng);
        }
    }
}

/// 每个 rqddurs 条目一个 slot，否则使用 [minduration, maxduration]
fn structured_slots(imp: &Imp, video: &Video) -> Vec<StructuredSlot> {
    match video.rqddurs.as_ref().filter(|d| !d.is_empty()) {
        Some(durations) => durations
            .iter()
            .map(|&d| StructuredSlot { imp_id: imp.id.clone(), min_duration: d, max_duration: d })
            .collect(),
        None => vec![StructuredSlot {
            imp_id: imp.id.clone(),
            min_duration: video.minduration.unwrap_or(0),
            max_duration: video.maxduration.unwrap_or(0),
        }],
    }
}
