// src/adpod/response.rs

use serde_json::{json, Map, Value};

use crate::adpod::pod::{AdPodContext, AdPodSet};
use crate::openrtb::response::{Bid, BidResponse, SeatBid};

/// 追加到同名 seat，不存在时新建（保持 seat 首次出现的顺序）
pub fn push_seat_bid(seatbids: &mut Vec<SeatBid>, seat: &str, bid: Bid) {
    match seatbids.iter_mut().find(|s| s.seat.as_deref() == Some(seat)) {
        Some(existing) => existing.bid.push(bid),
        None => seatbids.push(SeatBid {
            bid: vec![bid],
            seat: Some(seat.to_string()),
            group: Some(0),
        }),
    }
}

fn pod_extension(pod: &AdPodContext) -> Value {
    let (min, max) = pod.duration_bounds();
    let mut ext = json!({
        "type": pod.kind.name(),
        "impressions": pod.impressions.len(),
        "selected": pod.selection.selected_bid_ids(),
        "blockedVastTagIds": pod.blocked_tags,
        "duration": {"min": min, "max": max, "selected": pod.selection.total_duration},
    });

    if let Some(error) = &pod.error {
        ext["error"] = json!({"code": error.code(), "message": error.to_string()});
    }

    let mut seat_non_bids: Vec<(String, Vec<Value>)> = Vec::new();
    for loser in &pod.selection.losers {
        let entry = json!({
            "impid": loser.candidate.bid.impid,
            "bidid": loser.candidate.bid.id,
            "price": loser.candidate.bid.price,
            "reason": loser.reason.as_str(),
        });
        match seat_non_bids.iter_mut().find(|(seat, _)| seat == &loser.candidate.seat) {
            Some((_, entries)) => entries.push(entry),
            None => seat_non_bids.push((loser.candidate.seat.clone(), vec![entry])),
        }
    }
    if !seat_non_bids.is_empty() {
        ext["seatnonbid"] = Value::Array(
            seat_non_bids
                .into_iter()
                .map(|(seat, nonbid)| json!({"seat": seat, "nonbid": nonbid}))
                .collect(),
        );
    }
    ext
}

/// 合并普通 video bid 与各 pod 的胜出 bid，生成最终响应及 pod 扩展块
pub fn assemble(request_id: &str, plain_bids: Vec<(String, Bid)>, pods: &AdPodSet) -> BidResponse {
    let mut response = BidResponse::empty(request_id);
    for (seat, bid) in plain_bids {
        push_seat_bid(&mut response.seatbid, &seat, bid);
    }

    let mut pod_ext = Map::new();
    for pod in &pods.pods {
        for (position, winner) in pod.selection.winners.iter().enumerate() {
            let mut bid = winner.bid.clone();
            bid.set_ext_field(
                "adpod",
                json!({
                    "podid": pod.pod_id,
                    "position": position + 1,
                    "duration": winner.duration,
                }),
            );
            push_seat_bid(&mut response.seatbid, &winner.seat, bid);
        }
        pod_ext.insert(pod.pod_id.clone(), pod_extension(pod));
    }

    if !pod_ext.is_empty() {
        response.ext = Some(json!({ "adpod": pod_ext }));
    }
    response
}
