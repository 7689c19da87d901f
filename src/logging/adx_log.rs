// src/logging/adx_log.rs

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::adpod::pod::AdPodContext;
use crate::bidding::dsp_client::BidderCall;

/// 一次 CTV 竞价的聚合日志
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PodAuctionLog {
    pub timestamp: String,
    pub log_type: String,
    pub request_id: String,
    pub pub_id: i32,
    pub profile_id: i32,
    /// "success" / "no_fill"
    pub status: String,
    pub elapsed_ms: u128,
    pub plain_bids: usize,
    pub pods: Vec<PodOutcomeLog>,
    pub bidder_calls: Vec<BidderCallLog>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PodOutcomeLog {
    pub pod_id: String,
    pub pod_type: String,
    pub impressions: usize,
    pub winners: Vec<WinnerLog>,
    pub losers: usize,
    pub total_duration: i64,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WinnerLog {
    pub seat: String,
    pub bid_id: String,
    pub price: f64,
    pub duration: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BidderCallLog {
    pub bidder: String,
    pub url: String,
    pub status: String,
    pub elapsed_ms: u128,
    pub bids: usize,
    pub max_price: f64,
}

impl PodAuctionLog {
    pub fn new(request_id: &str, pub_id: i32, profile_id: i32) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            log_type: "ctv_pod_auction".to_string(),
            request_id: request_id.to_string(),
            pub_id,
            profile_id,
            status: "no_fill".to_string(),
            elapsed_ms: 0,
            plain_bids: 0,
            pods: Vec::new(),
            bidder_calls: Vec::new(),
        }
    }

    pub fn add_pod(&mut self, pod: &AdPodContext) {
        self.pods.push(PodOutcomeLog {
            pod_id: pod.pod_id.clone(),
            pod_type: pod.kind.name().to_string(),
            impressions: pod.impressions.len(),
            winners: pod
                .selection
                .winners
                .iter()
                .map(|w| WinnerLog {
                    seat: w.seat.clone(),
                    bid_id: w.bid.id.clone(),
                    price: w.bid.price,
                    duration: w.duration,
                })
                .collect(),
            losers: pod.selection.losers.len(),
            total_duration: pod.selection.total_duration,
            error: pod.error.as_ref().map(ToString::to_string),
        });
    }

    pub fn add_bidder_call(&mut self, call: &BidderCall) {
        let status = serde_json::to_value(call.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.bidder_calls.push(BidderCallLog {
            bidder: call.bidder.clone(),
            url: call.url.clone(),
            status,
            elapsed_ms: call.elapsed_ms,
            bids: call.bids,
            max_price: call.max_price,
        });
    }

    /// 有任一 bid 返回即视为成功
    pub fn finish(&mut self, plain_bids: usize, elapsed_ms: u128) {
        self.plain_bids = plain_bids;
        self.elapsed_ms = elapsed_ms;
        if plain_bids > 0 || self.pods.iter().any(|p| !p.winners.is_empty()) {
            self.status = "success".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bidding::dsp_client::CallStatus;

    #[test]
    fn status_reflects_any_delivered_bid() {
        let mut log = PodAuctionLog::new("req-1", 5890, 123);
        log.add_bidder_call(&BidderCall {
            bidder: "spotx".to_string(),
            url: "http://localhost/bid".to_string(),
            status: CallStatus::Timeout,
            elapsed_ms: 120,
            bids: 0,
            max_price: 0.0,
        });
        log.finish(0, 130);
        assert_eq!(log.status, "no_fill");
        assert_eq!(log.bidder_calls[0].status, "timeout");

        log.finish(1, 130);
        assert_eq!(log.status, "success");
    }
}
