// src/feature/mod.rs

pub mod families;
pub mod random;
pub mod snapshot;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::StoreError;
use crate::model::adapters::ConfigStore;
use crate::model::placements::MultiFloors;
use families::{
    enabled_publishers, AdUnitFormat, AnalyticsThrottle, FscData, MbmfData, TbfTraffic,
    FEATURE_AMP_MULTIFORMAT, FEATURE_MAX_FLOORS,
};
use random::{RandomSource, ThreadRandom};
use snapshot::DoubleBuffer;

/// 一次刷新的结果：失败的数据族名称
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefreshReport {
    pub failed: Vec<&'static str>,
}

impl RefreshReport {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ReloaderTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// 发布者功能配置缓存。
/// 每个数据族各自双缓冲，后台任务按固定间隔整体重建。
pub struct FeatureCache {
    store: Arc<dyn ConfigStore>,
    rng: Arc<dyn RandomSource>,
    refresh_interval: Duration,
    throttle_defaults: AnalyticsThrottle,

    fsc: DoubleBuffer<FscData>,
    tbf: DoubleBuffer<TbfTraffic>,
    amp_multiformat: DoubleBuffer<HashSet<i32>>,
    max_floors: DoubleBuffer<HashSet<i32>>,
    gdpr_countries: DoubleBuffer<HashSet<String>>,
    performance_dsps: DoubleBuffer<HashSet<i32>>,
    inview_dsps: DoubleBuffer<HashSet<i32>>,
    analytics_throttle: DoubleBuffer<AnalyticsThrottle>,
    mbmf: DoubleBuffer<MbmfData>,

    task: Mutex<Option<ReloaderTask>>,
}

impl FeatureCache {
    /// `throttle_defaults` 为配置中的默认限流串，在首次刷新前即生效
    pub fn new(store: Arc<dyn ConfigStore>, refresh_interval: Duration, throttle_defaults: &str) -> Self {
        Self::with_random(store, refresh_interval, throttle_defaults, Arc::new(ThreadRandom))
    }

    pub fn with_random(
        store: Arc<dyn ConfigStore>,
        refresh_interval: Duration,
        throttle_defaults: &str,
        rng: Arc<dyn RandomSource>,
    ) -> Self {
        let throttle_defaults = AnalyticsThrottle::parse(throttle_defaults);
        Self {
            store,
            rng,
            refresh_interval,
            analytics_throttle: DoubleBuffer::new(throttle_defaults.clone()),
            throttle_defaults,
            fsc: DoubleBuffer::default(),
            tbf: DoubleBuffer::default(),
            amp_multiformat: DoubleBuffer::default(),
            max_floors: DoubleBuffer::default(),
            gdpr_countries: DoubleBuffer::default(),
            performance_dsps: DoubleBuffer::default(),
            inview_dsps: DoubleBuffer::default(),
            mbmf: DoubleBuffer::default(),
            task: Mutex::new(None),
        }
    }

    /// 同步刷新一次，然后启动后台刷新任务。重复调用无副作用
    pub async fn start(self: &Arc<Self>) {
        if self.task.lock().is_some() {
            return;
        }
        self.refresh().await;

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.refresh_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        cache.refresh().await;
                    }
                }
            }
            info!("feature reloader stopped");
        });

        let mut task = self.task.lock();
        if task.is_some() {
            // 并发 start：保留先注册的任务
            handle.abort();
            return;
        }
        *task = Some(ReloaderTask { stop: stop_tx, handle });
        info!(interval_secs = self.refresh_interval.as_secs(), "feature reloader started");
    }

    /// 通知后台任务退出并等待其结束。重复调用无副作用
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.stop.send(());
            if let Err(e) = task.handle.await {
                error!(error = %e, "feature reloader task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// 逐个数据族重新拉取；单个失败只记录日志并保留旧快照
    pub async fn refresh(&self) -> RefreshReport {
        let mut report = RefreshReport::default();

        if let Err(e) = self.refresh_fsc().await {
            Self::record_failure(&mut report, "fsc", &e);
        }
        if let Err(e) = self.refresh_tbf().await {
            Self::record_failure(&mut report, "tbf", &e);
        }
        if let Err(e) = self.refresh_gdpr().await {
            Self::record_failure(&mut report, "gdpr_countries", &e);
        }
        if let Err(e) = self.refresh_performance_dsps().await {
            Self::record_failure(&mut report, "performance_dsps", &e);
        }
        if let Err(e) = self.refresh_inview_dsps().await {
            Self::record_failure(&mut report, "inview_dsps", &e);
        }
        if let Err(e) = self.refresh_publisher_features().await {
            Self::record_failure(&mut report, "publisher_features", &e);
        }

        report
    }

    fn record_failure(report: &mut RefreshReport, family: &'static str, e: &StoreError) {
        error!(family, error = %e, "feature refresh failed, keeping previous snapshot");
        report.failed.push(family);
    }

    async fn refresh_fsc(&self) -> Result<(), StoreError> {
        let disabled_publishers = self.store.fsc_disabled_publishers().await?;
        let thresholds_per_dsp = self.store.fsc_thresholds_per_dsp().await?;
        self.fsc.publish(FscData { disabled_publishers, thresholds_per_dsp });
        Ok(())
    }

    async fn refresh_tbf(&self) -> Result<(), StoreError> {
        let raw = self.store.tbf_traffic().await?;
        self.tbf.publish(TbfTraffic::from_raw(raw));
        Ok(())
    }

    async fn refresh_gdpr(&self) -> Result<(), StoreError> {
        let countries = self.store.gdpr_countries().await?;
        self.gdpr_countries.publish(countries);
        Ok(())
    }

    async fn refresh_performance_dsps(&self) -> Result<(), StoreError> {
        let dsps = self.store.performance_dsps().await?;
        self.performance_dsps.publish(dsps);
        Ok(())
    }

    async fn refresh_inview_dsps(&self) -> Result<(), StoreError> {
        let dsps = self.store.inview_dsps().await?;
        self.inview_dsps.publish(dsps);
        Ok(())
    }

    /// AMP、max-floors、埋点限流与 MBMF 均来自发布者功能表
    async fn refresh_publisher_features(&self) -> Result<(), StoreError> {
        let features = self.store.publisher_features().await?;

        self.amp_multiformat
            .publish(enabled_publishers(&features, FEATURE_AMP_MULTIFORMAT));
        self.max_floors
            .publish(enabled_publishers(&features, FEATURE_MAX_FLOORS));
        self.analytics_throttle
            .publish(AnalyticsThrottle::from_features(&features, &self.throttle_defaults));

        let profile_floors = match self.store.profile_adunit_multifloors().await {
            Ok(floors) => floors,
            Err(e) => {
                error!(family = "mbmf_profile_floors", error = %e, "feature refresh failed, keeping previous snapshot");
                self.mbmf.load().profile_adunit_floors.clone()
            }
        };
        self.mbmf.publish(MbmfData::from_features(&features, profile_floors));
        Ok(())
    }

    pub fn is_fsc_applicable(&self, pub_id: i32, dsp_id: i32) -> bool {
        self.fsc.load().is_applicable(pub_id, dsp_id, self.rng.as_ref())
    }

    pub fn is_tbf_enabled(&self, pub_id: i32, profile_id: i32) -> bool {
        self.tbf.load().is_enabled(pub_id, profile_id, self.rng.as_ref())
    }

    pub fn is_amp_multiformat_enabled(&self, pub_id: i32) -> bool {
        self.amp_multiformat.load().contains(&pub_id)
    }

    pub fn is_max_floors_enabled(&self, pub_id: i32) -> bool {
        self.max_floors.load().contains(&pub_id)
    }

    pub fn is_country_gdpr(&self, country: &str) -> bool {
        self.gdpr_countries.load().contains(country)
    }

    pub fn is_performance_dsp(&self, dsp_id: i32) -> bool {
        self.performance_dsps.load().contains(&dsp_id)
    }

    pub fn is_inview_dsp(&self, dsp_id: i32) -> bool {
        self.inview_dsps.load().contains(&dsp_id)
    }

    /// 返回 (logger 是否限流, tracker 是否限流)
    pub fn is_analytics_throttled(&self, pub_id: i32, profile_id: i32) -> (bool, bool) {
        match self.analytics_throttle.load().lookup(pub_id, profile_id) {
            Some(pct) => pct.is_throttled(self.rng.as_ref()),
            None => (false, false),
        }
    }

    pub fn is_mbmf_country_for_publisher(&self, country: &str, pub_id: i32) -> bool {
        self.mbmf.load().is_country_enabled(country, pub_id)
    }

    pub fn is_mbmf_publisher_enabled(&self, pub_id: i32) -> bool {
        self.mbmf.load().is_publisher_enabled(pub_id)
    }

    pub fn is_mbmf_enabled_for_format(&self, pub_id: i32, format: AdUnitFormat) -> bool {
        self.mbmf.load().is_enabled_for_format(pub_id, format)
    }

    pub fn mbmf_floors_for_format(&self, pub_id: i32, format: AdUnitFormat) -> Option<MultiFloors> {
        self.mbmf.load().floors_for_format(pub_id, format)
    }

    pub fn profile_adunit_floors(&self, profile_id: i32) -> Option<HashMap<String, MultiFloors>> {
        self.mbmf.load().profile_floors(profile_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::random::FixedRandom;
    use crate::model::adapters::{MemoryConfigStore, PublisherFeatureRow, StoreData, StoreFamily};
    use crate::model::placements::FeatureData;

    fn store_data() -> StoreData {
        StoreData {
            fsc_thresholds: HashMap::from([(6, 100)]),
            tbf_traffic: HashMap::from([(5890, HashMap::from([(123, 100)]))]),
            gdpr_countries: HashSet::from(["DE".to_string()]),
            performance_dsps: HashSet::from([6]),
            publisher_features: vec![PublisherFeatureRow {
                pub_id: 5890,
                feature_id: families::FEATURE_AMP_MULTIFORMAT,
                data: FeatureData { enabled: 1, value: String::new() },
            }],
            ..Default::default()
        }
    }

    fn cache(store: Arc<MemoryConfigStore>) -> Arc<FeatureCache> {
        Arc::new(FeatureCache::with_random(
            store,
            Duration::from_millis(20),
            "5890:0:-1:0",
            Arc::new(FixedRandom(0)),
        ))
    }

    #[tokio::test]
    async fn refresh_populates_every_family() {
        let store = Arc::new(MemoryConfigStore::new(store_data()));
        let cache = cache(store);
        assert!(!cache.is_fsc_applicable(1, 6));

        assert!(cache.refresh().await.is_ok());
        assert!(cache.is_fsc_applicable(1, 6));
        assert!(cache.is_tbf_enabled(5890, 123));
        assert!(!cache.is_tbf_enabled(5890, 124));
        assert!(cache.is_country_gdpr("DE"));
        assert!(cache.is_performance_dsp(6));
        assert!(!cache.is_inview_dsp(6));
        assert!(cache.is_amp_multiformat_enabled(5890));
        assert!(!cache.is_max_floors_enabled(5890));
    }

    #[tokio::test]
    async fn failed_family_keeps_previous_snapshot() {
        let store = Arc::new(MemoryConfigStore::new(store_data()));
        let cache = cache(Arc::clone(&store));
        cache.refresh().await;

        let mut changed = store_data();
        changed.gdpr_countries = HashSet::from(["FR".to_string()]);
        changed.performance_dsps = HashSet::new();
        store.replace(changed);
        store.set_failing(StoreFamily::Gdpr, true);

        let report = cache.refresh().await;
        assert_eq!(report.failed, vec!["gdpr_countries"]);
        assert!(cache.is_country_gdpr("DE"));
        assert!(!cache.is_country_gdpr("FR"));
        assert!(!cache.is_performance_dsp(6));
    }

    #[tokio::test]
    async fn throttle_defaults_apply_before_first_refresh() {
        let store = Arc::new(MemoryConfigStore::new(StoreData::default()));
        let cache = cache(store);
        assert_eq!(cache.is_analytics_throttled(5890, 77), (true, true));
        assert_eq!(cache.is_analytics_throttled(1, 1), (false, false));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let store = Arc::new(MemoryConfigStore::new(store_data()));
        let cache = cache(Arc::clone(&store));

        cache.start().await;
        cache.start().await;
        assert!(cache.is_running());
        assert!(cache.is_country_gdpr("DE"));

        let mut changed = store_data();
        changed.gdpr_countries = HashSet::from(["FR".to_string()]);
        store.replace(changed);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.is_country_gdpr("FR"));

        cache.stop().await;
        cache.stop().await;
        assert!(!cache.is_running());
    }
}
