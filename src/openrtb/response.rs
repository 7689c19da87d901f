// src/openrtb/response.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OpenRTB Bid Response
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BidResponse {
    pub id: String,
    #[serde(default)]
    pub seatbid: Vec<SeatBid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bidid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cur: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbr: Option<i32>,
    /// pod 维度的扩展块（`ext.adpod`）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
}

impl BidResponse {
    /// 无广告填充时的空响应
    pub fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            seatbid: vec![],
            bidid: None,
            cur: Some("USD".to_string()),
            nbr: None,
            ext: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SeatBid {
    #[serde(default)]
    pub bid: Vec<Bid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Bid {
    pub id: String,
    pub impid: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nurl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adomain: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cat: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dealid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
}

impl Bid {
    /// 创意时长：优先 `ext.prebid.video.duration`，其次 `dur`
    pub fn declared_duration(&self) -> Option<i64> {
        let from_ext = self
            .ext
            .as_ref()
            .and_then(|ext| ext.pointer("/prebid/video/duration"))
            .and_then(Value::as_i64);
        from_ext.or(self.dur).filter(|d| *d > 0)
    }

    /// bidder 回传的 DSP id：`ext.dspid`，其次 `ext.prebid.meta.networkId`
    pub fn dsp_id(&self) -> Option<i32> {
        let ext = self.ext.as_ref()?;
        ext.get("dspid")
            .or_else(|| ext.pointer("/prebid/meta/networkId"))
            .and_then(Value::as_i64)
            .and_then(|id| i32::try_from(id).ok())
            .filter(|id| *id > 0)
    }

    /// 在 `ext` 下写入一个键
    pub fn set_ext_field(&mut self, key: &str, value: Value) {
        let ext = self.ext.get_or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = ext {
            map.insert(key.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duration_prefers_prebid_ext() {
        let bid = Bid {
            dur: Some(30),
            ext: Some(json!({"prebid": {"video": {"duration": 15}}})),
            ..Default::default()
        };
        assert_eq!(bid.declared_duration(), Some(15));
    }

    #[test]
    fn non_positive_duration_is_ignored() {
        let bid = Bid { dur: Some(0), ..Default::default() };
        assert_eq!(bid.declared_duration(), None);
    }
}
