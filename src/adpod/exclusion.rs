// src/adpod/exclusion.rs

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::adpod::ext::{DurationMatching, DynamicPodConfig, ExclusionConfig};
use crate::feature::random::{predict, RandomSource};
use crate::openrtb::response::Bid;

/// 候选 bid 落选原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossReason {
    ExclusionAdvertiser,
    ExclusionCategory,
    DurationBudget,
    SlotFilled,
    DurationMismatch,
    LostToHigherBid,
    /// pod 未达到最少广告数 / 最短时长，已选中的 bid 全部撤回
    PodUnfilled,
}

impl LossReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossReason::ExclusionAdvertiser => "exclusion-advertiser",
            LossReason::ExclusionCategory => "exclusion-category",
            LossReason::DurationBudget => "duration-budget",
            LossReason::SlotFilled => "slot-filled",
            LossReason::DurationMismatch => "duration-mismatch",
            LossReason::LostToHigherBid => "lost-to-higher-bid",
            LossReason::PodUnfilled => "pod-unfilled",
        }
    }
}

/// 归属于某个 pod 的候选 bid
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateBid {
    pub seat: String,
    pub bid: Bid,
    pub original_imp_id: String,
    pub pod_id: String,
    /// 对应生成展示机会的序号
    pub sequence: usize,
    /// 到达顺序，价格相同时先到者优先
    pub arrival: usize,
    /// 参与预算计算的时长，竞价排除阶段确定
    pub duration: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LosingBid {
    pub candidate: CandidateBid,
    pub reason: LossReason,
}

/// 单个 pod 的竞价结果：胜出者按选中顺序排列
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WinningSelection {
    pub winners: Vec<CandidateBid>,
    pub losers: Vec<LosingBid>,
    pub total_duration: i64,
}

impl WinningSelection {
    fn lose(&mut self, candidate: CandidateBid, reason: LossReason) {
        self.losers.push(LosingBid { candidate, reason });
    }

    pub fn selected_bid_ids(&self) -> Vec<String> {
        self.winners.iter().map(|c| c.bid.id.clone()).collect()
    }
}

/// 生成展示机会上的时长约束，由调用方按序号提供
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDuration {
    pub sequence: usize,
    pub min_duration: i64,
    pub max_duration: i64,
}

/// bid 的有效时长：声明时长（缺省取展示机会最大时长），再按匹配策略校正
pub fn resolve_bid_duration(
    bid: &Bid,
    slot: &SlotDuration,
    matching: Option<DurationMatching>,
    durations: &[i64],
) -> Result<i64, LossReason> {
    let declared = bid.declared_duration().unwrap_or(slot.max_duration);
    if declared > slot.max_duration {
        return Err(LossReason::DurationMismatch);
    }
    let duration = match matching {
        Some(DurationMatching::Exact) if !durations.contains(&declared) => {
            return Err(LossReason::DurationMismatch)
        }
        Some(DurationMatching::Roundup) => durations
            .iter()
            .copied()
            .filter(|d| *d >= declared)
            .min()
            .ok_or(LossReason::DurationMismatch)?,
        _ => declared,
    };
    if duration > slot.max_duration {
        return Err(LossReason::DurationMismatch);
    }
    Ok(duration)
}

/// 价格降序；sort_by 是稳定排序，同价按到达顺序
fn sort_by_price(candidates: &mut [CandidateBid]) {
    candidates.sort_by(|a, b| {
        b.bid
            .price
            .partial_cmp(&a.bid.price)
            .unwrap_or(Ordering::Equal)
            .then(a.arrival.cmp(&b.arrival))
    });
}

/// 已入选广告的广告主域名与品类
#[derive(Debug, Default)]
struct ExclusionState {
    domains: HashSet<String>,
    categories: HashSet<String>,
}

impl ExclusionState {
    /// 与已入选广告重复时按百分比掷骰，命中则排除
    fn check(&self, bid: &Bid, config: &ExclusionConfig, rng: &dyn RandomSource) -> Option<LossReason> {
        let repeats_domain = bid.adomain.iter().any(|d| self.domains.contains(d));
        if repeats_domain && predict(rng, config.advertiser_percent as i32) {
            return Some(LossReason::ExclusionAdvertiser);
        }
        let repeats_category = bid.cat.iter().any(|c| self.categories.contains(c));
        if repeats_category && predict(rng, config.category_percent as i32) {
            return Some(LossReason::ExclusionCategory);
        }
        None
    }

    fn admit(&mut self, bid: &Bid) {
        self.domains.extend(bid.adomain.iter().cloned());
        self.categories.extend(bid.cat.iter().cloned());
    }
}

/// 动态 pod：按价格贪心选取，受广告数与总时长预算约束
pub fn select_dynamic(
    candidates: Vec<CandidateBid>,
    config: &DynamicPodConfig,
    slots: &[SlotDuration],
    rng: &dyn RandomSource,
) -> WinningSelection {
    let mut selection = WinningSelection::default();
    let mut eligible = Vec::with_capacity(candidates.len());
    for mut candidate in candidates {
        let Some(slot) = slots.iter().find(|s| s.sequence == candidate.sequence) else {
            selection.lose(candidate, LossReason::DurationMismatch);
            continue;
        };
        match resolve_bid_duration(&candidate.bid, slot, config.matching, &config.durations) {
            Ok(duration) => {
                candidate.duration = duration;
                eligible.push(candidate);
            }
            Err(reason) => selection.lose(candidate, reason),
        }
    }
    sort_by_price(&mut eligible);

    let mut state = ExclusionState::default();
    for candidate in eligible {
        if selection.winners.len() as i64 >= config.max_ads {
            selection.lose(candidate, LossReason::LostToHigherBid);
            continue;
        }
        if selection.total_duration + candidate.duration > config.pod_max_duration {
            selection.lose(candidate, LossReason::DurationBudget);
            continue;
        }
        if let Some(reason) = state.check(&candidate.bid, &config.exclusion, rng) {
            selection.lose(candidate, reason);
            continue;
        }
        state.admit(&candidate.bid);
        selection.total_duration += candidate.duration;
        selection.winners.push(candidate);
    }
    selection
}

/// 最少广告数与最短总时长是否满足
pub fn meets_minimum_fill(selection: &WinningSelection, config: &DynamicPodConfig) -> bool {
    selection.winners.len() as i64 >= config.min_ads
        && selection.total_duration >= config.pod_min_duration
}

/// 撤回全部胜出者
pub fn withdraw_winners(selection: &mut WinningSelection) {
    let winners = std::mem::take(&mut selection.winners);
    selection.total_duration = 0;
    for candidate in winners {
        selection.lose(candidate, LossReason::PodUnfilled);
    }
}

/// 结构化 pod：每个 slot 一个胜出者，排除规则跨 slot 生效
pub fn select_structured(
    candidates: Vec<CandidateBid>,
    slots: &[SlotDuration],
    exclusion: &ExclusionConfig,
    rng: &dyn RandomSource,
) -> WinningSelection {
    let mut selection = WinningSelection::default();
    let mut per_slot: Vec<Vec<CandidateBid>> = vec![Vec::new(); slots.len()];
    for mut candidate in candidates {
        let Some(index) = slots.iter().position(|s| s.sequence == candidate.sequence) else {
            selection.lose(candidate, LossReason::DurationMismatch);
            continue;
        };
        match resolve_bid_duration(&candidate.bid, &slots[index], None, &[]) {
            Ok(duration) => {
                candidate.duration = duration;
                per_slot[index].push(candidate);
            }
            Err(reason) => selection.lose(candidate, reason),
        }
    }

    let mut state = ExclusionState::default();
    for mut bids in per_slot {
        sort_by_price(&mut bids);
        let mut filled = false;
        for candidate in bids {
            if filled {
                selection.lose(candidate, LossReason::SlotFilled);
                continue;
            }
            if let Some(reason) = state.check(&candidate.bid, exclusion, rng) {
                selection.lose(candidate, reason);
                continue;
            }
            state.admit(&candidate.bid);
            selection.total_duration += candidate.duration;
            selection.winners.push(candidate);
            filled = true;
        }
    }
    selection
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::random::{FixedRandom, SequenceRandom};

    fn candidate(id: &str, price: f64, dur: i64, domain: &str, sequence: usize, arrival: usize) -> CandidateBid {
        CandidateBid {
            seat: "pubmatic".to_string(),
            bid: Bid {
                id: id.to_string(),
                impid: format!("imp1::imp1::{}", sequence),
                price,
                dur: Some(dur),
                adomain: vec![domain.to_string()],
                cat: vec![format!("IAB-{}", domain)],
                ..Default::default()
            },
            original_imp_id: "imp1".to_string(),
            pod_id: "imp1".to_string(),
            sequence,
            arrival,
            duration: 0,
        }
    }

    fn pod(min_ads: i64, max_ads: i64, pod_max: i64, advertiser_percent: i64) -> DynamicPodConfig {
        DynamicPodConfig {
            min_ads,
            max_ads,
            min_duration: 10,
            max_duration: 30,
            pod_min_duration: 0,
            pod_max_duration: pod_max,
            exclusion: ExclusionConfig { advertiser_percent, category_percent: 0 },
            durations: vec![],
            matching: None,
        }
    }

    fn slots(n: usize, max: i64) -> Vec<SlotDuration> {
        (1..=n).map(|sequence| SlotDuration { sequence, min_duration: 10, max_duration: max }).collect()
    }

    #[test]
    fn both_bids_fit_the_budget() {
        let bids = vec![candidate("a", 5.0, 15, "a.com", 1, 0), candidate("b", 4.0, 20, "b.com", 2, 1)];
        let selection = select_dynamic(bids, &pod(1, 2, 40, 100), &slots(2, 30), &FixedRandom(0));
        assert_eq!(selection.selected_bid_ids(), vec!["a", "b"]);
        assert_eq!(selection.total_duration, 35);
        assert!(selection.losers.is_empty());
    }

    #[test]
    fn full_advertiser_exclusion_never_repeats_a_domain() {
        let bids = vec![
            candidate("a", 5.0, 10, "same.com", 1, 0),
            candidate("b", 4.0, 10, "same.com", 2, 1),
            candidate("c", 3.0, 10, "other.com", 2, 2),
        ];
        // 任何随机值下 100% 都会排除
        let selection = select_dynamic(bids, &pod(1, 3, 60, 100), &slots(3, 30), &FixedRandom(99));
        assert_eq!(selection.selected_bid_ids(), vec!["a", "c"]);
        assert_eq!(selection.losers[0].reason, LossReason::ExclusionAdvertiser);
    }

    #[test]
    fn zero_percent_allows_repeats() {
        let bids = vec![candidate("a", 5.0, 10, "same.com", 1, 0), candidate("b", 4.0, 10, "same.com", 2, 1)];
        let selection = select_dynamic(bids, &pod(1, 3, 60, 0), &slots(3, 30), &FixedRandom(0));
        assert_eq!(selection.winners.len(), 2);
    }

    #[test]
    fn partial_percentage_uses_the_random_draw() {
        let bids = || vec![candidate("a", 5.0, 10, "same.com", 1, 0), candidate("b", 4.0, 10, "same.com", 2, 1)];
        let excluded = select_dynamic(bids(), &pod(1, 3, 60, 50), &slots(3, 30), &SequenceRandom::new(vec![10]));
        assert_eq!(excluded.winners.len(), 1);
        let allowed = select_dynamic(bids(), &pod(1, 3, 60, 50), &slots(3, 30), &SequenceRandom::new(vec![80]));
        assert_eq!(allowed.winners.len(), 2);
    }

    #[test]
    fn equal_prices_keep_arrival_order() {
        let bids = vec![candidate("late", 5.0, 10, "x.com", 1, 1), candidate("early", 5.0, 10, "y.com", 1, 0)];
        let selection = select_dynamic(bids, &pod(1, 1, 60, 0), &slots(1, 30), &FixedRandom(0));
        assert_eq!(selection.selected_bid_ids(), vec!["early"]);
        assert_eq!(selection.losers[0].reason, LossReason::LostToHigherBid);
    }

    #[test]
    fn budget_and_duration_mismatch_reasons() {
        let bids = vec![
            candidate("a", 9.0, 30, "a.com", 1, 0),
            candidate("b", 8.0, 20, "b.com", 2, 1),
            candidate("c", 7.0, 45, "c.com", 2, 2),
        ];
        let selection = select_dynamic(bids, &pod(1, 3, 40, 0), &slots(3, 30), &FixedRandom(0));
        assert_eq!(selection.selected_bid_ids(), vec!["a"]);
        let reasons: Vec<(String, LossReason)> = selection
            .losers
            .iter()
            .map(|l| (l.candidate.bid.id.clone(), l.reason))
            .collect();
        assert!(reasons.contains(&("b".to_string(), LossReason::DurationBudget)));
        assert!(reasons.contains(&("c".to_string(), LossReason::DurationMismatch)));
    }

    #[test]
    fn minimum_fill_withdraws_winners() {
        let bids = vec![candidate("a", 5.0, 10, "a.com", 1, 0)];
        let config = pod(2, 3, 60, 0);
        let mut selection = select_dynamic(bids, &config, &slots(3, 30), &FixedRandom(0));
        assert!(!meets_minimum_fill(&selection, &config));
        withdraw_winners(&mut selection);
        assert!(selection.winners.is_empty());
        assert_eq!(selection.losers[0].reason, LossReason::PodUnfilled);
    }

    #[test]
    fn roundup_and_exact_matching() {
        let slot = SlotDuration { sequence: 1, min_duration: 5, max_duration: 30 };
        let bid = Bid { dur: Some(12), ..Default::default() };
        assert_eq!(resolve_bid_duration(&bid, &slot, Some(DurationMatching::Roundup), &[10, 15, 30]), Ok(15));
        assert_eq!(
            resolve_bid_duration(&bid, &slot, Some(DurationMatching::Exact), &[10, 15]),
            Err(LossReason::DurationMismatch)
        );
        let unknown = Bid::default();
        assert_eq!(resolve_bid_duration(&unknown, &slot, None, &[]), Ok(30));
    }

    #[test]
    fn structured_pod_fills_each_slot_once() {
        let bids = vec![
            candidate("s1-high", 6.0, 15, "a.com", 1, 0),
            candidate("s1-low", 3.0, 15, "b.com", 1, 1),
            candidate("s2-dup", 5.0, 15, "a.com", 2, 2),
            candidate("s2-ok", 2.0, 15, "c.com", 2, 3),
        ];
        let exclusion = ExclusionConfig { advertiser_percent: 100, category_percent: 0 };
        let selection = select_structured(bids, &slots(2, 15), &exclusion, &FixedRandom(0));
        assert_eq!(selection.selected_bid_ids(), vec!["s1-high", "s2-ok"]);
        let reasons: Vec<LossReason> = selection.losers.iter().map(|l| l.reason).collect();
        assert_eq!(reasons, vec![LossReason::SlotFilled, LossReason::ExclusionAdvertiser]);
    }
}
