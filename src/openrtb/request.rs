// src/openrtb/request.rs

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OpenRTB BidRequest 结构体。
/// 只对 pod 决策需要的字段做强类型解析，其余对象保留为原始 JSON。
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BidRequest {
    pub id: String,

    #[serde(default)]
    pub imp: Vec<Imp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<Site>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<App>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regs: Option<Value>,

    // 其它简单字段
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmax: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cur: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bcat: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badv: Option<Vec<String>>,

    /// 请求扩展：包含 `adpod`（请求级 pod 默认值）与 `wrapper`（profile / version）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    #[serde(skip)]
    pub wrapper_detail: OnceCell<WrapperExt>,
}

/// 单个广告展示机会
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Imp {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<Banner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Video>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native: Option<Native>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tagid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bidfloor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Banner {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub format: Vec<Format>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Format {
    pub w: i64,
    pub h: i64,
}

/// Video 对象，包含 ORTB 2.6 的 pod 字段（podid / poddur / maxseq / rqddurs）
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Video {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mimes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minduration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxduration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub podid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poddur: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxseq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rqddurs: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxextended: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Native {
    pub request: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ver: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Publisher {
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Site {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<Publisher>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct App {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<Publisher>,
}

/// `ext.wrapper` 中的 profile 与 version 信息
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WrapperExt {
    #[serde(default)]
    pub profileid: i32,
    #[serde(default)]
    pub versionid: i32,
}

// Getter 方法实现
impl BidRequest {
    pub fn get_wrapper_detail(&self) -> &WrapperExt {
        self.wrapper_detail.get_or_init(|| {
            self.ext
                .as_ref()
                .and_then(|ext| ext.get("wrapper"))
                .and_then(|raw| serde_json::from_value(raw.clone()).ok())
                .unwrap_or_default()
        })
    }

    /// 请求级 `ext.adpod` 原始 JSON
    pub fn adpod_ext_raw(&self) -> Option<&Value> {
        self.ext.as_ref().and_then(|ext| ext.get("adpod"))
    }

    /// 发布者 ID：优先 site.publisher，其次 app.publisher
    pub fn publisher_id(&self) -> Option<i32> {
        let from_site = self
            .site
            .as_ref()
            .and_then(|s| s.publisher.as_ref())
            .map(|p| p.id.as_str());
        let from_app = self
            .app
            .as_ref()
            .and_then(|a| a.publisher.as_ref())
            .map(|p| p.id.as_str());
        from_site.or(from_app).and_then(|id| id.trim().parse().ok())
    }

    /// 请求来源：site.domain 或 app.bundle
    pub fn source_name(&self) -> String {
        if let Some(site) = &self.site {
            return site.domain.clone().unwrap_or_default();
        }
        self.app
            .as_ref()
            .and_then(|a| a.bundle.clone())
            .unwrap_or_default()
    }
}

impl Imp {
    /// `imp.video.ext.adpod` 原始 JSON
    pub fn video_adpod_ext_raw(&self) -> Option<&Value> {
        self.video
            .as_ref()
            .and_then(|v| v.ext.as_ref())
            .and_then(|ext| ext.get("adpod"))
    }

    /// `imp.ext.wrapper.div`
    pub fn wrapper_div(&self) -> String {
        self.ext
            .as_ref()
            .and_then(|ext| ext.get("wrapper"))
            .and_then(|w| w.get("div"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// 写入某个 bidder 的参数：`imp.ext.bidder.<code>`
    pub fn set_bidder_params(&mut self, bidder: &str, params: Value) {
        let ext = self.ext.get_or_insert_with(|| Value::Object(Default::default()));
        if !ext.is_object() {
            *ext = Value::Object(Default::default());
        }
        if let Value::Object(map) = ext {
            let bidders = map
                .entry("bidder")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Value::Object(bidders) = bidders {
                bidders.insert(bidder.to_string(), params);
            }
        }
    }

    pub fn bidder_params(&self, bidder: &str) -> Option<&Value> {
        self.ext
            .as_ref()
            .and_then(|ext| ext.get("bidder"))
            .and_then(|b| b.get(bidder))
    }

    pub fn bidder_params_mut(&mut self) -> Option<&mut serde_json::Map<String, Value>> {
        self.ext
            .as_mut()
            .and_then(|ext| ext.get_mut("bidder"))
            .and_then(Value::as_object_mut)
    }
}
