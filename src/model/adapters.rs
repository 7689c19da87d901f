// src/model/adapters.rs

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::StoreError;
use crate::model::placements::{
    FeatureData, MultiFloors, PartnerConfig, PartnerSlotMappings, SlotMappingRow, VastTag,
};

/// 外部配置存储（只读）。每个查询独立返回值或错误。
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn partner_configs(
        &self,
        pub_id: i32,
        profile_id: i32,
        display_version: i32,
    ) -> Result<HashMap<i32, PartnerConfig>, StoreError>;

    async fn slot_mappings(
        &self,
        pub_id: i32,
        profile_id: i32,
        display_version: i32,
        partner_id: i32,
    ) -> Result<PartnerSlotMappings, StoreError>;

    async fn vast_tags(&self, pub_id: i32) -> Result<HashMap<i32, VastTag>, StoreError>;

    async fn publisher_features(&self) -> Result<HashMap<i32, HashMap<i32, FeatureData>>, StoreError>;

    async fn fsc_disabled_publishers(&self) -> Result<HashSet<i32>, StoreError>;

    async fn fsc_thresholds_per_dsp(&self) -> Result<HashMap<i32, i32>, StoreError>;

    async fn tbf_traffic(&self) -> Result<HashMap<i32, HashMap<i32, i32>>, StoreError>;

    async fn gdpr_countries(&self) -> Result<HashSet<String>, StoreError>;

    async fn performance_dsps(&self) -> Result<HashSet<i32>, StoreError>;

    async fn inview_dsps(&self) -> Result<HashSet<i32>, StoreError>;

    async fn profile_adunit_multifloors(
        &self,
    ) -> Result<HashMap<i32, HashMap<String, MultiFloors>>, StoreError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PartnerRow {
    pub pub_id: i32,
    pub profile_id: i32,
    #[serde(default)]
    pub version_id: i32,
    #[serde(flatten)]
    pub config: PartnerConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScopedSlotMappingRow {
    pub pub_id: i32,
    pub profile_id: i32,
    #[serde(flatten)]
    pub row: SlotMappingRow,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PublisherVastTagRow {
    pub pub_id: i32,
    #[serde(flatten)]
    pub tag: VastTag,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PublisherFeatureRow {
    pub pub_id: i32,
    pub feature_id: i32,
    #[serde(flatten)]
    pub data: FeatureData,
}

/// 存储内容的整体快照（文件存储与内存存储共用）
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StoreData {
    #[serde(default)]
    pub partners: Vec<PartnerRow>,
    #[serde(default)]
    pub slot_mappings: Vec<ScopedSlotMappingRow>,
    #[serde(default)]
    pub vast_tags: Vec<PublisherVastTagRow>,
    #[serde(default)]
    pub publisher_features: Vec<PublisherFeatureRow>,
    #[serde(default)]
    pub fsc_disabled_publishers: HashSet<i32>,
    #[serde(default)]
    pub fsc_thresholds: HashMap<i32, i32>,
    #[serde(default)]
    pub tbf_traffic: HashMap<i32, HashMap<i32, i32>>,
    #[serde(default)]
    pub gdpr_countries: HashSet<String>,
    #[serde(default)]
    pub performance_dsps: HashSet<i32>,
    #[serde(default)]
    pub inview_dsps: HashSet<i32>,
    #[serde(default)]
    pub profile_adunit_floors: HashMap<i32, HashMap<String, MultiFloors>>,
}

impl StoreData {
    fn partner_configs(&self, pub_id: i32, profile_id: i32, version: i32) -> HashMap<i32, PartnerConfig> {
        self.partners
            .iter()
            .filter(|p| p.pub_id == pub_id && p.profile_id == profile_id && p.version_id == version)
            .map(|p| (p.config.partner_id, p.config.clone()))
            .collect()
    }

    fn slot_mappings(&self, pub_id: i32, profile_id: i32, version: i32, partner_id: i32) -> PartnerSlotMappings {
        let rows = self
            .slot_mappings
            .iter()
            .filter(|s| {
                s.pub_id == pub_id
                    && s.profile_id == profile_id
                    && s.row.version_id == version
                    && s.row.partner_id == partner_id
            })
            .map(|s| s.row.clone())
            .collect();
        PartnerSlotMappings::from_rows(rows)
    }

    fn vast_tags(&self, pub_id: i32) -> HashMap<i32, VastTag> {
        self.vast_tags
            .iter()
            .filter(|t| t.pub_id == pub_id)
            .map(|t| (t.tag.id, t.tag.clone()))
            .collect()
    }

    fn publisher_features(&self) -> HashMap<i32, HashMap<i32, FeatureData>> {
        let mut out: HashMap<i32, HashMap<i32, FeatureData>> = HashMap::new();
        for row in &self.publisher_features {
            out.entry(row.pub_id)
                .or_default()
                .insert(row.feature_id, row.data.clone());
        }
        out
    }
}

/// 基于 JSON 文件的配置存储，每次查询重新读取文件
pub struct FileConfigStore {
    pub path: String,
}

impl FileConfigStore {
    pub fn new(path: &str) -> Self {
        Self { path: path.to_string() }
    }

    async fn load(&self) -> Result<StoreData, StoreError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| StoreError::Read { path: self.path.clone(), source })?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn partner_configs(&self, pub_id: i32, profile_id: i32, version: i32) -> Result<HashMap<i32, PartnerConfig>, StoreError> {
        Ok(self.load().await?.partner_configs(pub_id, profile_id, version))
    }

    async fn slot_mappings(&self, pub_id: i32, profile_id: i32, version: i32, partner_id: i32) -> Result<PartnerSlotMappings, StoreError> {
        Ok(self.load().await?.slot_mappings(pub_id, profile_id, version, partner_id))
    }

    async fn vast_tags(&self, pub_id: i32) -> Result<HashMap<i32, VastTag>, StoreError> {
        Ok(self.load().await?.vast_tags(pub_id))
    }

    async fn publisher_features(&self) -> Result<HashMap<i32, HashMap<i32, FeatureData>>, StoreError> {
        Ok(self.load().await?.publisher_features())
    }

    async fn fsc_disabled_publishers(&self) -> Result<HashSet<i32>, StoreError> {
        Ok(self.load().await?.fsc_disabled_publishers)
    }

    async fn fsc_thresholds_per_dsp(&self) -> Result<HashMap<i32, i32>, StoreError> {
        Ok(self.load().await?.fsc_thresholds)
    }

    async fn tbf_traffic(&self) -> Result<HashMap<i32, HashMap<i32, i32>>, StoreError> {
        Ok(self.load().await?.tbf_traffic)
    }

    async fn gdpr_countries(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.load().await?.gdpr_countries)
    }

    async fn performance_dsps(&self) -> Result<HashSet<i32>, StoreError> {
        Ok(self.load().await?.performance_dsps)
    }

    async fn inview_dsps(&self) -> Result<HashSet<i32>, StoreError> {
        Ok(self.load().await?.inview_dsps)
    }

    async fn profile_adunit_multifloors(&self) -> Result<HashMap<i32, HashMap<String, MultiFloors>>, StoreError> {
        Ok(self.load().await?.profile_adunit_floors)
    }
}

/// 存储中可单独模拟失败的数据族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreFamily {
    Partners,
    SlotMappings,
    VastTags,
    PublisherFeatures,
    Fsc,
    Tbf,
    Gdpr,
    PerformanceDsps,
    InviewDsps,
    ProfileFloors,
}

/// 内存配置存储，可替换数据并对某个数据族注入失败
#[derive(Default)]
pub struct MemoryConfigStore {
    data: RwLock<StoreData>,
    failing: RwLock<HashSet<StoreFamily>>,
}

impl MemoryConfigStore {
    pub fn new(data: StoreData) -> Self {
        Self {
            data: RwLock::new(data),
            failing: RwLock::new(HashSet::new()),
        }
    }

    pub fn replace(&self, data: StoreData) {
        *self.data.write() = data;
    }

    pub fn set_failing(&self, family: StoreFamily, failing: bool) {
        let mut set = self.failing.write();
        if failing {
            set.insert(family);
        } else {
            set.remove(&family);
        }
    }

    fn check(&self, family: StoreFamily) -> Result<(), StoreError> {
        if self.failing.read().contains(&family) {
            return Err(StoreError::Unavailable(format!("{:?}", family)));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn partner_configs(&self, pub_id: i32, profile_id: i32, version: i32) -> Result<HashMap<i32, PartnerConfig>, StoreError> {
        self.check(StoreFamily::Partners)?;
        Ok(self.data.read().partner_configs(pub_id, profile_id, version))
    }

    async fn slot_mappings(&self, pub_id: i32, profile_id: i32, version: i32, partner_id: i32) -> Result<PartnerSlotMappings, StoreError> {
        self.check(StoreFamily::SlotMappings)?;
        Ok(self.data.read().slot_mappings(pub_id, profile_id, version, partner_id))
    }

    async fn vast_tags(&self, pub_id: i32) -> Result<HashMap<i32, VastTag>, StoreError> {
        self.check(StoreFamily::VastTags)?;
        Ok(self.data.read().vast_tags(pub_id))
    }

    async fn publisher_features(&self) -> Result<HashMap<i32, HashMap<i32, FeatureData>>, StoreError> {
        self.check(StoreFamily::PublisherFeatures)?;
        Ok(self.data.read().publisher_features())
    }

    async fn fsc_disabled_publishers(&self) -> Result<HashSet<i32>, StoreError> {
        self.check(StoreFamily::Fsc)?;
        Ok(self.data.read().fsc_disabled_publishers.clone())
    }

    async fn fsc_thresholds_per_dsp(&self) -> Result<HashMap<i32, i32>, StoreError> {
        self.check(StoreFamily::Fsc)?;
        Ok(self.data.read().fsc_thresholds.clone())
    }

    async fn tbf_traffic(&self) -> Result<HashMap<i32, HashMap<i32, i32>>, StoreError> {
        self.check(StoreFamily::Tbf)?;
        Ok(self.data.read().tbf_traffic.clone())
    }

    async fn gdpr_countries(&self) -> Result<HashSet<String>, StoreError> {
        self.check(StoreFamily::Gdpr)?;
        Ok(self.data.read().gdpr_countries.clone())
    }

    async fn performance_dsps(&self) -> Result<HashSet<i32>, StoreError> {
        self.check(StoreFamily::PerformanceDsps)?;
        Ok(self.data.read().performance_dsps.clone())
    }

    async fn inview_dsps(&self) -> Result<HashSet<i32>, StoreError> {
        self.check(StoreFamily::InviewDsps)?;
        Ok(self.data.read().inview_dsps.clone())
    }

    async fn profile_adunit_multifloors(&self) -> Result<HashMap<i32, HashMap<String, MultiFloors>>, StoreError> {
        self.check(StoreFamily::ProfileFloors)?;
        Ok(self.data.read().profile_adunit_floors.clone())
    }
}
