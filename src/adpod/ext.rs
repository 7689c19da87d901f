// src/adpod/ext.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PodError;

pub const DEFAULT_MIN_ADS: i64 = 1;
pub const DEFAULT_MAX_ADS: i64 = 3;
pub const DEFAULT_EXCLUSION_PERCENT: i64 = 0;

/// `videoaddurationmatching` 的取值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationMatching {
    Exact,
    Roundup,
}

impl DurationMatching {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exact" => Some(DurationMatching::Exact),
            "roundup" => Some(DurationMatching::Roundup),
            _ => None,
        }
    }
}

/// `ext.adpod` 对象（请求级或 `imp.video.ext.adpod`）。
/// 字段全部可选，展示级设置按字段覆盖请求级设置。
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AdPodExt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minads: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxads: Option<i64>,
    /// 单个广告的最短时长
    #[serde(default, alias = "adminduration", skip_serializing_if = "Option::is_none")]
    pub minduration: Option<i64>,
    /// 单个广告的最长时长
    #[serde(default, alias = "admaxduration", skip_serializing_if = "Option::is_none")]
    pub maxduration: Option<i64>,
    #[serde(
        default,
        rename = "advertiserExclusionPercent",
        alias = "excladv",
        skip_serializing_if = "Option::is_none"
    )]
    pub advertiser_exclusion_percent: Option<i64>,
    #[serde(
        default,
        rename = "iabCategoryExclusionPercent",
        alias = "excliabcat",
        skip_serializing_if = "Option::is_none"
    )]
    pub category_exclusion_percent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub videoadduration: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub videoaddurationmatching: Option<String>,
}

impl AdPodExt {
    /// 解析失败属于请求级校验错误
    pub fn parse(raw: &Value, imp_id: &str) -> Result<Self, PodError> {
        serde_json::from_value(raw.clone()).map_err(|e| PodError::MalformedExtension {
            imp_id: imp_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// 以 `self` 为准逐字段合并，缺失字段取 `base`
    pub fn merge_over(&self, base: &AdPodExt) -> AdPodExt {
        AdPodExt {
            minads: self.minads.or(base.minads),
            maxads: self.maxads.or(base.maxads),
            minduration: self.minduration.or(base.minduration),
            maxduration: self.maxduration.or(base.maxduration),
            advertiser_exclusion_percent: self
                .advertiser_exclusion_percent
                .or(base.advertiser_exclusion_percent),
            category_exclusion_percent: self
                .category_exclusion_percent
                .or(base.category_exclusion_percent),
            videoadduration: self
                .videoadduration
                .clone()
                .or_else(|| base.videoadduration.clone()),
            videoaddurationmatching: self
                .videoaddurationmatching
                .clone()
                .or_else(|| base.videoaddurationmatching.clone()),
        }
    }

    pub fn exclusion(&self) -> ExclusionConfig {
        ExclusionConfig {
            advertiser_percent: self
                .advertiser_exclusion_percent
                .unwrap_or(DEFAULT_EXCLUSION_PERCENT),
            category_percent: self
                .category_exclusion_percent
                .unwrap_or(DEFAULT_EXCLUSION_PERCENT),
        }
    }
}

/// 竞争排除配置：重复广告主 / 品类被排除的概率（百分比）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExclusionConfig {
    pub advertiser_percent: i64,
    pub category_percent: i64,
}

impl ExclusionConfig {
    fn validate(&self) -> Result<(), PodError> {
        if !(0..=100).contains(&self.advertiser_percent) {
            return Err(PodError::Constraint(
                "adpod.advertiserExclusionPercent must be a number between 0 and 100".to_string(),
            ));
        }
        if !(0..=100).contains(&self.category_percent) {
            return Err(PodError::Constraint(
                "adpod.iabCategoryExclusionPercent must be a number between 0 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

/// 补齐默认值后的动态 pod 配置
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DynamicPodConfig {
    pub min_ads: i64,
    pub max_ads: i64,
    /// 单个广告时长区间
    pub min_duration: i64,
    pub max_duration: i64,
    /// 整个 pod 的时长预算
    pub pod_min_duration: i64,
    pub pod_max_duration: i64,
    pub exclusion: ExclusionConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub durations: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matching: Option<DurationMatching>,
}

impl DynamicPodConfig {
    /// 缺失的 minads / maxads / 排除百分比取默认值；
    /// 缺失的单广告时长取 [0, pod 最大时长]
    pub fn resolve(ext: &AdPodExt, pod_min_duration: i64, pod_max_duration: i64) -> Self {
        Self {
            min_ads: ext.minads.unwrap_or(DEFAULT_MIN_ADS),
            max_ads: ext.maxads.unwrap_or(DEFAULT_MAX_ADS),
            min_duration: ext.minduration.unwrap_or(0),
            max_duration: ext.maxduration.unwrap_or(pod_max_duration),
            pod_min_duration,
            pod_max_duration,
            exclusion: ext.exclusion(),
            durations: ext.videoadduration.clone().unwrap_or_default(),
            matching: ext
                .videoaddurationmatching
                .as_deref()
                .and_then(DurationMatching::parse),
        }
    }

    /// 按时长列表生成展示机会的条件：列表非空且匹配策略为 exact / roundup
    pub fn uses_duration_ranges(&self) -> bool {
        !self.durations.is_empty() && self.matching.is_some()
    }

    pub fn validate(&self) -> Result<(), PodError> {
        let fail = |msg: &str| -> Result<(), PodError> { Err(PodError::Constraint(msg.to_string())) };

        if self.pod_min_duration < 0 {
            return fail("imp.video.minduration must be a positive number");
        }
        if self.pod_max_duration <= 0 {
            return fail("imp.video.maxduration must be a positive non zero number");
        }
        if self.pod_min_duration > self.pod_max_duration {
            return fail("imp.video.minduration must be less than imp.video.maxduration");
        }
        if self.min_ads <= 0 {
            return fail("adpod.minads must be a positive number");
        }
        if self.max_ads <= 0 {
            return fail("adpod.maxads must be a positive number");
        }
        if self.min_duration < 0 {
            return fail("adpod.minduration must be a positive number");
        }
        if self.max_duration <= 0 {
            return fail("adpod.maxduration must be a positive number");
        }
        self.exclusion.validate()?;
        if self.min_ads > self.max_ads {
            return fail("adpod.minads must be less than adpod.maxads");
        }
        if self.min_duration > self.max_duration {
            return fail("adpod.minduration must be less than adpod.maxduration");
        }
        if !(self.min_ads.saturating_mul(self.min_duration) <= self.pod_max_duration
            && self.pod_min_duration <= self.max_ads.saturating_mul(self.max_duration))
        {
            return fail(
                "adpod duration checks for minduration,maxduration,minads,maxads are not in video minduration and maxduration range",
            );
        }
        if !self.durations.is_empty()
            && !self
                .durations
                .iter()
                .any(|d| (self.min_duration..=self.max_duration).contains(d))
        {
            return fail("videoadduration values should be between adpod.minduration and adpod.maxduration");
        }
        Ok(())
    }
}
