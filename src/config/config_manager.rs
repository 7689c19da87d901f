// src/config/config_manager.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::adpod::impressions::DEFAULT_MULTIPLE_OF;
use crate::error::StoreError;
use crate::model::dsp::{Demand, DemandManager};

/// 服务配置（JSON 文件），所有字段都有默认值
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub port: u16,
    pub log_dir: String,
    /// 请求未携带 tmax 时使用的截止时间
    pub tmax_default_ms: u64,
    pub tmax_min_ms: u64,
    pub tmax_max_ms: u64,
    pub feature_refresh_interval_secs: u64,
    /// 文件配置存储路径
    pub store_path: String,
    pub demands: Vec<Demand>,
    /// `<pub>:<profile>:<logger%>:<tracker%>,...`
    pub analytics_throttle_default: String,
    pub impression_algorithm_multiple_of: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            log_dir: "logs".to_string(),
            tmax_default_ms: 250,
            tmax_min_ms: 50,
            tmax_max_ms: 1000,
            feature_refresh_interval_secs: 300,
            store_path: "static/store.json".to_string(),
            demands: Vec::new(),
            analytics_throttle_default: String::new(),
            impression_algorithm_multiple_of: DEFAULT_MULTIPLE_OF,
        }
    }
}

impl AppConfig {
    pub fn from_json(content: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load(path: &str) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| StoreError::Read { path: path.to_string(), source })?;
        Self::from_json(&content)
    }
}

/// 命令行覆盖项，None 表示沿用配置文件
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub log_dir: Option<String>,
    pub store_path: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ConfigManager {
    config: AppConfig,
    demand_manager: DemandManager,
}

impl ConfigManager {
    pub fn new(config: AppConfig) -> Self {
        let demand_manager = DemandManager::from_demands(config.demands.clone());
        Self { config, demand_manager }
    }

    /// 读取配置文件（不存在时使用默认配置），再应用命令行覆盖
    pub fn from_args(path: Option<&str>, overrides: ConfigOverrides) -> Result<Self, StoreError> {
        let mut config = match path {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        if let Some(port) = overrides.port {
            config.port = port;
        }
        if let Some(log_dir) = overrides.log_dir {
            config.log_dir = log_dir;
        }
        if let Some(store_path) = overrides.store_path {
            config.store_path = store_path;
        }
        info!(
            port = config.port,
            demands = config.demands.len(),
            store = %config.store_path,
            "configuration loaded"
        );
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn active_demands(&self) -> Vec<Demand> {
        self.demand_manager.active_demands()
    }

    /// 请求截止时间：tmax 缺省时取默认值，然后限制在 [min, max]
    pub fn deadline(&self, tmax: Option<u64>) -> Duration {
        let requested = tmax.filter(|t| *t > 0).unwrap_or(self.config.tmax_default_ms);
        let upper = self.config.tmax_max_ms.max(self.config.tmax_min_ms);
        Duration::from_millis(requested.clamp(self.config.tmax_min_ms, upper))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.config.feature_refresh_interval_secs.max(1))
    }

    pub fn multiple_of(&self) -> i64 {
        match self.config.impression_algorithm_multiple_of {
            m if m > 0 => m,
            _ => DEFAULT_MULTIPLE_OF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = AppConfig::from_json(r#"{"tmax_max_ms": 500}"#).unwrap();
        assert_eq!(config.tmax_max_ms, 500);
        assert_eq!(config.tmax_default_ms, 250);
        assert_eq!(config.impression_algorithm_multiple_of, 5);
    }

    #[test]
    fn deadline_is_clamped() {
        let manager = ConfigManager::new(AppConfig::default());
        assert_eq!(manager.deadline(None), Duration::from_millis(250));
        assert_eq!(manager.deadline(Some(10)), Duration::from_millis(50));
        assert_eq!(manager.deadline(Some(5000)), Duration::from_millis(1000));
        assert_eq!(manager.deadline(Some(0)), Duration::from_millis(250));
    }

    #[test]
    fn cli_overrides_win_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": 9000, "demands": [{{"id": 1, "name": "spotx", "url": "http://127.0.0.1:1/bid", "status": false}}]}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let manager = ConfigManager::from_args(
            Some(&path),
            ConfigOverrides { port: Some(7070), ..Default::default() },
        )
        .unwrap();
        assert_eq!(manager.config().port, 7070);
        assert_eq!(manager.config().demands.len(), 1);
        assert!(manager.active_demands().is_empty());
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let err = ConfigManager::from_args(Some("/nonexistent/ctv-adx.json"), ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, StoreError::Read { .. }));
    }
}
