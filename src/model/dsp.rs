// src/model/dsp.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 竞价方（bidder）基础信息，表示一个可调用的需求方端点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Demand {
    pub id: u64,              // DemandManager 中的唯一 ID
    pub name: String,         // bidder 代码，与 partner 配置中的 bidder_code 对应
    pub url: String,          // 竞价 API 地址
    #[serde(default = "default_status")]
    pub status: bool,         // 是否启用
    #[serde(default)]
    pub timeout: Option<u64>, // 每个 bidder 的超时（毫秒）
}

fn default_status() -> bool {
    true
}

impl Demand {
    pub fn new(id: u64, name: &str, url: &str, status: bool, timeout: Option<u64>) -> Self {
        Self {
            id,
            name: name.to_string(),
            url: url.to_string(),
            status,
            timeout,
        }
    }
}

/// 需求方管理器。按 ID 有序保存，保证扇出顺序稳定
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DemandManager {
    pub demands: BTreeMap<u64, Demand>,
}

impl DemandManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_demands(demands: Vec<Demand>) -> Self {
        let mut manager = Self::new();
        for demand in demands {
            manager.add_demand(demand);
        }
        manager
    }

    pub fn add_demand(&mut self, demand: Demand) {
        self.demands.insert(demand.id, demand);
    }

    pub fn remove_demand(&mut self, demand_id: u64) {
        self.demands.remove(&demand_id);
    }

    pub fn get_demand(&self, demand_id: u64) -> Option<&Demand> {
        self.demands.get(&demand_id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Demand> {
        self.demands.values().find(|d| d.name == name)
    }

    pub fn active_demands(&self) -> Vec<Demand> {
        self.demands.values().filter(|d| d.status).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_enabled_demands_are_active() {
        let manager = DemandManager::from_demands(vec![
            Demand::new(2, "spotx", "http://localhost:9002/bid", false, None),
            Demand::new(1, "pubmatic", "http://localhost:9001/bid", true, Some(150)),
        ]);
        let active = manager.active_demands();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "pubmatic");
        assert_eq!(manager.find_by_name("spotx").map(|d| d.id), Some(2));
    }
}
