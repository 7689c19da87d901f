// src/bidding/dsp_client.rs

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::time::Instant;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, warn};

use crate::error::AuctionError;
use crate::model::dsp::Demand;
use crate::openrtb::request::{BidRequest, Imp};
use crate::openrtb::response::{Bid, BidResponse};

/// bidder 超时
pub const NON_BID_TIMEOUT: u32 = 101;
/// 非 2xx 或传输失败
pub const NON_BID_INVALID_RESPONSE: u32 = 102;
/// 响应体无法解析
pub const NON_BID_UNPARSEABLE: u32 = 103;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    NoBid,
    Timeout,
    InvalidResponse,
    ParseError,
}

impl CallStatus {
    pub fn non_bid_code(&self) -> Option<u32> {
        match self {
            CallStatus::Success | CallStatus::NoBid => None,
            CallStatus::Timeout => Some(NON_BID_TIMEOUT),
            CallStatus::InvalidResponse => Some(NON_BID_INVALID_RESPONSE),
            CallStatus::ParseError => Some(NON_BID_UNPARSEABLE),
        }
    }
}

/// 单个 bidder 调用的明细，写入聚合竞价日志
#[derive(Debug, Clone, Serialize)]
pub struct BidderCall {
    pub bidder: String,
    pub url: String,
    pub status: CallStatus,
    pub elapsed_ms: u128,
    pub bids: usize,
    pub max_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BidderNonBid {
    pub bidder: String,
    pub code: u32,
}

/// 一次扇出竞价的全部结果
#[derive(Debug, Clone, Default)]
pub struct AuctionOutcome {
    /// (bidder, 响应)，按 bidder 配置顺序
    pub responses: Vec<(String, BidResponse)>,
    pub calls: Vec<BidderCall>,
}

impl AuctionOutcome {
    /// 展开为 (seat, bid)。seat 缺省时使用 bidder 代码
    pub fn seat_bids(&self) -> Vec<(String, Bid)> {
        let mut bids = Vec::new();
        for (bidder, response) in &self.responses {
            for seatbid in &response.seatbid {
                let seat = seatbid
                    .seat
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .unwrap_or(bidder.as_str());
                bids.extend(seatbid.bid.iter().map(|bid| (seat.to_string(), bid.clone())));
            }
        }
        bids
    }

    pub fn non_bids(&self) -> Vec<BidderNonBid> {
        self.calls
            .iter()
            .filter_map(|call| {
                call.status.non_bid_code().map(|code| BidderNonBid { bidder: call.bidder.clone(), code })
            })
            .collect()
    }
}

/// 竞价执行器：把请求扇出给各 bidder 并收集响应
#[async_trait]
pub trait AuctionExecutor: Send + Sync {
    async fn execute(&self, request: &BidRequest, deadline: Duration) -> Result<AuctionOutcome, AuctionError>;
}

/// 基于 HTTP 的执行器，每个启用的 demand 一个任务
pub struct HttpAuctionExecutor {
    client: Client,
    demands: Vec<Demand>,
}

impl HttpAuctionExecutor {
    pub fn new(demands: Vec<Demand>) -> Self {
        Self {
            client: Client::new(),
            demands,
        }
    }

    pub fn demands(&self) -> &[Demand] {
        &self.demands
    }
}

fn has_bidder_params(imp: &Imp) -> bool {
    imp.ext.as_ref().and_then(|ext| ext.get("bidder")).is_some()
}

/// 为某个 bidder 裁剪请求：只保留带有该 bidder 参数的展示机会，
/// `imp.ext.bidder` 只留下它自己的参数。请求中没有任何 bidder 参数时原样发送。
pub fn bidder_request(request: &BidRequest, bidder: &str) -> Option<BidRequest> {
    if !request.imp.iter().any(has_bidder_params) {
        return Some(request.clone());
    }

    let imps: Vec<Imp> = request
        .imp
        .iter()
        .filter_map(|imp| {
            let params = imp.bidder_params(bidder)?.clone();
            let mut imp = imp.clone();
            if let Some(Value::Object(ext)) = imp.ext.as_mut() {
                let mut own = Map::new();
                own.insert(bidder.to_string(), params);
                ext.insert("bidder".to_string(), Value::Object(own));
            }
            Some(imp)
        })
        .collect();
    if imps.is_empty() {
        return None;
    }
    let mut outgoing = request.clone();
    outgoing.imp = imps;
    Some(outgoing)
}

async fn send(client: &Client, url: &str, request: &BidRequest) -> Result<Option<BidResponse>, CallStatus> {
    let resp = client
        .post(url)
        .header("Content-Type", "application/json")
        .json(request)
        .send()
        .await
        .map_err(|_| CallStatus::InvalidResponse)?;

    if resp.status() == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if !resp.status().is_success() {
        return Err(CallStatus::InvalidResponse);
    }
    let mut body = resp
        .bytes()
        .await
        .map_err(|_| CallStatus::InvalidResponse)?
        .to_vec();
    simd_json::serde::from_slice::<BidResponse>(&mut body)
        .map(Some)
        .map_err(|_| CallStatus::ParseError)
}

async fn call_bidder(client: Client, demand: Demand, request: BidRequest, limit: Duration) -> (BidderCall, Option<BidResponse>) {
    let start = Instant::now();
    let result = timeout(limit, send(&client, &demand.url, &request)).await;
    let elapsed_ms = start.elapsed().as_millis();

    let (status, response) = match result {
        Ok(Ok(Some(response))) if response.seatbid.iter().any(|s| !s.bid.is_empty()) => {
            (CallStatus::Success, Some(response))
        }
        Ok(Ok(_)) => (CallStatus::NoBid, None),
        Ok(Err(status)) => (status, None),
        Err(_) => (CallStatus::Timeout, None),
    };

    let (bids, max_price) = response
        .as_ref()
        .map(|r| {
            let prices: Vec<f64> = r.seatbid.iter().flat_map(|s| s.bid.iter().map(|b| b.price)).collect();
            let max = prices
                .iter()
                .copied()
                .max_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                .unwrap_or(0.0);
            (prices.len(), max)
        })
        .unwrap_or((0, 0.0));

    if status.non_bid_code().is_some() {
        warn!(bidder = %demand.name, status = ?status, elapsed_ms, "bidder call failed");
    } else {
        debug!(bidder = %demand.name, bids, elapsed_ms, "bidder responded");
    }

    let call = BidderCall {
        bidder: demand.name,
        url: demand.url,
        status,
        elapsed_ms,
        bids,
        max_price,
    };
    (call, response)
}

#[async_trait]
impl AuctionExecutor for HttpAuctionExecutor {
    async fn execute(&self, request: &BidRequest, deadline: Duration) -> Result<AuctionOutcome, AuctionError> {
        let tasks: Vec<_> = self
            .demands
            .iter()
            .filter(|demand| demand.status)
            .filter_map(|demand| {
                let outgoing = bidder_request(request, &demand.name)?;
                let limit = demand
                    .timeout
                    .map(|t| Duration::from_millis(t).min(deadline))
                    .unwrap_or(deadline);
                let client = self.client.clone();
                let demand = demand.clone();
                Some(tokio::spawn(call_bidder(client, demand, outgoing, limit)))
            })
            .collect();

        let mut outcome = AuctionOutcome::default();
        for joined in join_all(tasks).await {
            match joined {
                Ok((call, response)) => {
                    if let Some(response) = response {
                        outcome.responses.push((call.bidder.clone(), response));
                    }
                    outcome.calls.push(call);
                }
                Err(e) => error!(error = %e, "bidder task aborted"),
            }
        }

        if !outcome.calls.is_empty() && outcome.calls.iter().all(|c| c.status == CallStatus::Timeout) {
            return Err(AuctionError::Cancelled { deadline_ms: deadline.as_millis() as u64 });
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as HttpStatus, routing::post, Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    use crate::openrtb::response::SeatBid;

    async fn bid_handler(Json(request): Json<BidRequest>) -> Json<BidResponse> {
        let bids = request
            .imp
            .iter()
            .map(|imp| Bid {
                id: format!("bid-{}", imp.id),
                impid: imp.id.clone(),
                price: 2.5,
                ..Default::default()
            })
            .collect();
        Json(BidResponse {
            id: request.id,
            seatbid: vec![SeatBid { bid: bids, seat: None, group: Some(0) }],
            ..Default::default()
        })
    }

    async fn slow_handler() -> Json<Value> {
        sleep(Duration::from_millis(500)).await;
        Json(json!({"id": "late", "seatbid": []}))
    }

    async fn error_handler() -> HttpStatus {
        HttpStatus::INTERNAL_SERVER_ERROR
    }

    async fn garbage_handler() -> &'static str {
        "not json"
    }

    async fn mock_bidders() -> String {
        let app = Router::new()
            .route("/bid", post(bid_handler))
            .route("/slow", post(slow_handler))
            .route("/error", post(error_handler))
            .route("/garbage", post(garbage_handler));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn request() -> BidRequest {
        serde_json::from_value(json!({"id": "req-1", "imp": [{"id": "imp1", "video": {}}]})).unwrap()
    }

    #[tokio::test]
    async fn failures_become_non_bids_without_aborting_siblings() {
        let base = mock_bidders().await;
        let executor = HttpAuctionExecutor::new(vec![
            Demand::new(1, "good", &format!("{}/bid", base), true, None),
            Demand::new(2, "slow", &format!("{}/slow", base), true, Some(50)),
            Demand::new(3, "broken", &format!("{}/error", base), true, None),
            Demand::new(4, "garbled", &format!("{}/garbage", base), true, None),
            Demand::new(5, "disabled", &format!("{}/bid", base), false, None),
        ]);

        let outcome = executor.execute(&request(), Duration::from_millis(300)).await.unwrap();
        assert_eq!(outcome.calls.len(), 4);
        assert_eq!(outcome.seat_bids().len(), 1);
        assert_eq!(outcome.seat_bids()[0].0, "good");

        let codes: Vec<(String, u32)> = outcome.non_bids().into_iter().map(|n| (n.bidder, n.code)).collect();
        assert_eq!(
            codes,
            vec![
                ("slow".to_string(), NON_BID_TIMEOUT),
                ("broken".to_string(), NON_BID_INVALID_RESPONSE),
                ("garbled".to_string(), NON_BID_UNPARSEABLE),
            ]
        );
    }

    #[tokio::test]
    async fn all_bidders_timing_out_cancels_the_auction() {
        let base = mock_bidders().await;
        let executor = HttpAuctionExecutor::new(vec![Demand::new(1, "slow", &format!("{}/slow", base), true, None)]);
        let err = executor.execute(&request(), Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, AuctionError::Cancelled { deadline_ms: 50 }));
    }

    #[test]
    fn bidder_request_keeps_only_own_params() {
        let mut req = request();
        let mut second = req.imp[0].clone();
        second.id = "imp2".to_string();
        req.imp[0].set_bidder_params("spotx", json!({"adSlot": "a"}));
        req.imp[0].set_bidder_params("pubmatic", json!({"adSlot": "b"}));
        second.set_bidder_params("pubmatic", json!({"adSlot": "c"}));
        req.imp.push(second);

        let spotx = bidder_request(&req, "spotx").unwrap();
        assert_eq!(spotx.imp.len(), 1);
        assert!(spotx.imp[0].bidder_params("pubmatic").is_none());
        assert_eq!(bidder_request(&req, "pubmatic").unwrap().imp.len(), 2);
        assert!(bidder_request(&req, "unknown").is_none());
        assert_eq!(bidder_request(&request(), "unknown").unwrap().imp.len(), 1);
    }
}
