// src/feature/families.rs

use std::collections::{HashMap, HashSet};
use tracing::{error, warn};

use crate::feature::random::{predict, RandomSource};
use crate::model::placements::{FeatureData, MultiFloors};

pub const FEATURE_FSC: i32 = 1;
pub const FEATURE_TBF: i32 = 2;
pub const FEATURE_AMP_MULTIFORMAT: i32 = 3;
pub const FEATURE_ANALYTICS_THROTTLE: i32 = 4;
pub const FEATURE_MAX_FLOORS: i32 = 5;
pub const FEATURE_MBMF_COUNTRY: i32 = 9;
pub const FEATURE_MBMF_PUBLISHER: i32 = 10;
pub const FEATURE_MBMF_INSTL_FLOORS: i32 = 11;
pub const FEATURE_MBMF_RWDD_FLOORS: i32 = 12;

/// 所有 profile 的通配 ID
pub const ALL_PROFILES: i32 = 0;
/// MBMF 默认底价所在的 pub ID
pub const DEFAULT_FLOORS_PUB: i32 = 0;

pub type PublisherFeatureMap = HashMap<i32, HashMap<i32, FeatureData>>;

/// 全屏可点击（FSC）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FscData {
    pub disabled_publishers: HashSet<i32>,
    pub thresholds_per_dsp: HashMap<i32, i32>,
}

impl FscData {
    pub fn is_applicable(&self, pub_id: i32, dsp_id: i32, rng: &dyn RandomSource) -> bool {
        if self.disabled_publishers.contains(&pub_id) {
            return false;
        }
        self.thresholds_per_dsp
            .get(&dsp_id)
            .map_or(false, |threshold| predict(rng, *threshold))
    }
}

/// TBF 流量百分比：pub -> profile -> 百分比
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TbfTraffic(pub HashMap<i32, HashMap<i32, i32>>);

impl TbfTraffic {
    /// 超出 [0,100] 的值归零
    pub fn from_raw(raw: HashMap<i32, HashMap<i32, i32>>) -> Self {
        let cleaned = raw
            .into_iter()
            .map(|(pub_id, profiles)| {
                let profiles = profiles
                    .into_iter()
                    .map(|(profile_id, pct)| {
                        if !(0..=100).contains(&pct) {
                            warn!(pub_id, profile_id, pct, "tbf traffic out of range, using 0");
                            (profile_id, 0)
                        } else {
                            (profile_id, pct)
                        }
                    })
                    .collect();
                (pub_id, profiles)
            })
            .collect();
        TbfTraffic(cleaned)
    }

    pub fn is_enabled(&self, pub_id: i32, profile_id: i32, rng: &dyn RandomSource) -> bool {
        self.0
            .get(&pub_id)
            .and_then(|profiles| profiles.get(&profile_id))
            .map_or(false, |pct| predict(rng, *pct))
    }
}

/// enabled == 1 的发布者集合
pub fn enabled_publishers(features: &PublisherFeatureMap, feature_id: i32) -> HashSet<i32> {
    features
        .iter()
        .filter(|(_, f)| f.get(&feature_id).map_or(false, |d| d.enabled == 1))
        .map(|(pub_id, _)| *pub_id)
        .collect()
}

/// 单个 (pub, profile) 的埋点限流百分比
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePercentage {
    /// -1 表示 logger 与 tracker 均强制限流
    pub logger: i32,
    pub tracker: i32,
}

impl ThrottlePercentage {
    /// 返回 (logger 是否限流, tracker 是否限流)。logger 被限流时 tracker 必然限流
    pub fn is_throttled(&self, rng: &dyn RandomSource) -> (bool, bool) {
        if self.logger < 0 || predict(rng, self.logger) {
            return (true, true);
        }
        (false, self.tracker > 0 && predict(rng, self.tracker))
    }
}

/// 埋点限流表：pub -> profile -> 百分比
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsThrottle(pub HashMap<i32, HashMap<i32, ThrottlePercentage>>);

impl AnalyticsThrottle {
    /// 解析 `<pub>:<profile>:<logger%>:<tracker%>` 以逗号分隔的列表，非法项跳过
    pub fn parse(value: &str) -> Self {
        let mut table = AnalyticsThrottle::default();
        table.add(value);
        table
    }

    pub fn add(&mut self, value: &str) {
        for key in value.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            match parse_throttle_key(key) {
                Some((pub_id, profile_id, pct)) => {
                    self.0.entry(pub_id).or_default().insert(profile_id, pct);
                }
                None => warn!(key, "invalid analytics throttling key"),
            }
        }
    }

    /// 合并 source，已存在的条目保留
    pub fn merge_missing(&mut self, source: &AnalyticsThrottle) {
        for (pub_id, profiles) in &source.0 {
            let target = self.0.entry(*pub_id).or_default();
            for (profile_id, pct) in profiles {
                target.entry(*profile_id).or_insert(*pct);
            }
        }
    }

    /// 先查具体 profile，再查 profile 0
    pub fn lookup(&self, pub_id: i32, profile_id: i32) -> Option<ThrottlePercentage> {
        let profiles = self.0.get(&pub_id)?;
        profiles
            .get(&profile_id)
            .or_else(|| profiles.get(&ALL_PROFILES))
            .copied()
    }

    pub fn from_features(features: &PublisherFeatureMap, defaults: &AnalyticsThrottle) -> Self {
        let mut table = AnalyticsThrottle::default();
        for feature in features.values() {
            if let Some(data) = feature.get(&FEATURE_ANALYTICS_THROTTLE) {
                if data.enabled == 1 {
                    table.add(&data.value);
                }
            }
        }
        table.merge_missing(defaults);
        table
    }
}

fn parse_throttle_key(key: &str) -> Option<(i32, i32, ThrottlePercentage)> {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() != 4 {
        return None;
    }
    let pub_id: i32 = parts[0].trim().parse().ok().filter(|v| *v > 0)?;
    let profile_id: i32 = parts[1].trim().parse().ok().filter(|v| *v >= 0)?;
    let logger: i32 = parts[2].trim().parse().ok().filter(|v| *v >= -1 && *v <= 100)?;
    let tracker: i32 = parts[3].trim().parse().ok().filter(|v| *v >= 0 && *v <= 100)?;
    Some((pub_id, profile_id, ThrottlePercentage { logger, tracker }))
}

/// MBMF 广告单元格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdUnitFormat {
    Interstitial,
    RewardedVideo,
    Other,
}

impl AdUnitFormat {
    pub fn parse(value: &str) -> Self {
        match value {
            "instl" => AdUnitFormat::Interstitial,
            "rwddvideo" => AdUnitFormat::RewardedVideo,
            _ => AdUnitFormat::Other,
        }
    }
}

/// 多出价多底价（MBMF）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MbmfData {
    pub enabled_countries: HashMap<i32, HashSet<String>>,
    pub enabled_publishers: HashMap<i32, bool>,
    pub profile_adunit_floors: HashMap<i32, HashMap<String, MultiFloors>>,
    pub instl_floors: HashMap<i32, MultiFloors>,
    pub rwdd_floors: HashMap<i32, MultiFloors>,
}

impl MbmfData {
    pub fn from_features(
        features: &PublisherFeatureMap,
        profile_adunit_floors: HashMap<i32, HashMap<String, MultiFloors>>,
    ) -> Self {
        let mut data = MbmfData {
            profile_adunit_floors,
            ..Default::default()
        };
        for (pub_id, feature) in features {
            if let Some(val) = feature.get(&FEATURE_MBMF_COUNTRY) {
                if val.enabled == 1 {
                    let countries = data.enabled_countries.entry(*pub_id).or_default();
                    countries.extend(
                        val.value
                            .split(',')
                            .map(str::trim)
                            .filter(|c| !c.is_empty())
                            .map(str::to_string),
                    );
                }
            }
            if let Some(val) = feature.get(&FEATURE_MBMF_PUBLISHER) {
                data.enabled_publishers.insert(*pub_id, val.enabled == 1);
            }
            if let Some(floors) = extract_multi_floors(feature, FEATURE_MBMF_INSTL_FLOORS, *pub_id) {
                data.instl_floors.insert(*pub_id, floors);
            }
            if let Some(floors) = extract_multi_floors(feature, FEATURE_MBMF_RWDD_FLOORS, *pub_id) {
                data.rwdd_floors.insert(*pub_id, floors);
            }
        }
        data
    }

    /// 发布者未配置国家列表时使用 pub 0 的列表
    pub fn is_country_enabled(&self, country: &str, pub_id: i32) -> bool {
        match self.enabled_countries.get(&pub_id) {
            Some(countries) => countries.contains(country),
            None => self
                .enabled_countries
                .get(&DEFAULT_FLOORS_PUB)
                .map_or(false, |countries| countries.contains(country)),
        }
    }

    /// 未配置视为启用
    pub fn is_publisher_enabled(&self, pub_id: i32) -> bool {
        self.enabled_publishers.get(&pub_id).copied().unwrap_or(true)
    }

    fn floors_for(&self, format: AdUnitFormat) -> Option<&HashMap<i32, MultiFloors>> {
        match format {
            AdUnitFormat::Interstitial => Some(&self.instl_floors),
            AdUnitFormat::RewardedVideo => Some(&self.rwdd_floors),
            AdUnitFormat::Other => None,
        }
    }

    pub fn is_enabled_for_format(&self, pub_id: i32, format: AdUnitFormat) -> bool {
        match self.floors_for(format) {
            Some(floors) => floors.get(&pub_id).map_or(true, |f| f.is_active),
            None => false,
        }
    }

    pub fn floors_for_format(&self, pub_id: i32, format: AdUnitFormat) -> Option<MultiFloors> {
        let floors = self.floors_for(format)?;
        let found = floors
            .get(&pub_id)
            .or_else(|| floors.get(&DEFAULT_FLOORS_PUB))
            .cloned();
        if found.is_none() {
            error!(pub_id, ?format, "mbmf default floors not found");
        }
        found
    }

    pub fn profile_floors(&self, profile_id: i32) -> Option<&HashMap<String, MultiFloors>> {
        self.profile_adunit_floors.get(&profile_id)
    }
}

fn extract_multi_floors(feature: &HashMap<i32, FeatureData>, feature_id: i32, pub_id: i32) -> Option<MultiFloors> {
    let data = feature.get(&feature_id)?;
    if data.enabled == 0 {
        return Some(MultiFloors::default());
    }
    match serde_json::from_str::<MultiFloors>(&data.value) {
        Ok(mut floors) => {
            floors.is_active = true;
            Some(floors)
        }
        Err(e) => {
            error!(pub_id, feature_id, error = %e, "failed to parse mbmf floors");
            None
        }
    }
}
