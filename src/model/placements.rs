// src/model/placements.rs

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

/// 下发给 bidder 的参数中，仅用于内部覆盖逻辑、不应透传的键
pub const KEY_OW_SLOT_NAME: &str = "owSlotName";
pub const KEY_SLOT_NAME: &str = "slotName";

pub const BIDDER_VAST: &str = "vastbidder";

/// 支持正则匹配的 key 生成模板
pub const REGEX_KGP: &str = "_AU_@_DIV_@_W_x_H_";
pub const ADUNIT_SIZE_REGEX_KGP: &str = "_RE_@_W_x_H_";

/// 合作方（partner）配置，按 (pub, profile, displayVersion) 加载
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PartnerConfig {
    pub partner_id: i32,
    pub bidder_code: String,
    #[serde(default)]
    pub adapter_id: i32,
    /// key 生成模板（KGP），例如 `_AU_@_W_x_H_`
    #[serde(default)]
    pub key_gen_pattern: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl PartnerConfig {
    pub fn is_regex_kgp(&self) -> bool {
        self.key_gen_pattern == REGEX_KGP || self.key_gen_pattern == ADUNIT_SIZE_REGEX_KGP
    }

    pub fn is_vast_bidder(&self) -> bool {
        self.bidder_code == BIDDER_VAST
    }
}

/// 存储中的原始广告位映射行
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SlotMappingRow {
    pub partner_id: i32,
    #[serde(default)]
    pub adapter_id: i32,
    #[serde(default)]
    pub version_id: i32,
    pub slot_name: String,
    /// bidder 参数 JSON（字符串形式，解析失败的行会被跳过）
    pub mapping_json: String,
    #[serde(default)]
    pub order_id: i64,
    #[serde(default)]
    pub hash: String,
}

/// 已解析的广告位映射
#[derive(Debug, Clone, PartialEq)]
pub struct SlotMapping {
    pub partner_id: i32,
    pub adapter_id: i32,
    pub version_id: i32,
    /// DB 中的规范名称（保留原始大小写）
    pub slot_name: String,
    pub params: Map<String, Value>,
    /// 非正则命中时替换下发的 slot 名称
    pub alternate_name: Option<String>,
    /// 二级接入（secondary flow）的 slot 名称，优先级高于 alternate_name
    pub secondary_name: Option<String>,
}

impl SlotMapping {
    /// 下发参数：去掉内部保留键
    pub fn outgoing_params(&self) -> Map<String, Value> {
        self.params
            .iter()
            .filter(|(k, _)| k.as_str() != KEY_OW_SLOT_NAME && k.as_str() != KEY_SLOT_NAME)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// 有序的 slot 列表（DB order_id 顺序，正则匹配依赖此顺序）与 pattern 到 hash 的映射
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotMappingInfo {
    pub ordered_slot_list: Vec<String>,
    pub hash_value_map: HashMap<String, String>,
}

/// 单个 partner 的全部广告位映射
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartnerSlotMappings {
    /// key 为小写 slot 名称
    pub mappings: HashMap<String, SlotMapping>,
    pub info: SlotMappingInfo,
}

impl PartnerSlotMappings {
    /// 由存储行构建：按 order_id 稳定排序，参数 JSON 无效的行跳过
    pub fn from_rows(mut rows: Vec<SlotMappingRow>) -> Self {
        rows.sort_by_key(|row| row.order_id);

        let mut out = PartnerSlotMappings::default();
        for row in rows {
            let params = match serde_json::from_str::<Value>(&row.mapping_json) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    warn!(slot = %row.slot_name, partner_id = row.partner_id, "skipping slot mapping with invalid json");
                    continue;
                }
            };

            let alternate_name = params
                .get(KEY_OW_SLOT_NAME)
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(row.slot_name.clone()));
            let secondary_name = params
                .get(KEY_SLOT_NAME)
                .and_then(Value::as_str)
                .map(str::to_string);

            out.info.hash_value_map.insert(row.slot_name.clone(), row.hash.clone());
            out.info.ordered_slot_list.push(row.slot_name.clone());
            out.mappings.insert(
                row.slot_name.to_lowercase(),
                SlotMapping {
                    partner_id: row.partner_id,
                    adapter_id: row.adapter_id,
                    version_id: row.version_id,
                    slot_name: row.slot_name,
                    params,
                    alternate_name,
                    secondary_name,
                },
            );
        }
        out
    }

    pub fn get(&self, slot: &str) -> Option<&SlotMapping> {
        self.mappings.get(&slot.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// 发布者预先声明的 VAST 标签
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VastTag {
    pub id: i32,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub price: f64,
}

/// 发布者功能开关原始数据（feature-id 维度）
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FeatureData {
    #[serde(default)]
    pub enabled: i32,
    #[serde(default)]
    pub value: String,
}

/// MBMF 多底价
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MultiFloors {
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub tier1: f64,
    #[serde(default)]
    pub tier2: f64,
    #[serde(default)]
    pub tier3: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(slot: &str, order: i64, json: &str) -> SlotMappingRow {
        SlotMappingRow {
            partner_id: 1,
            adapter_id: 1,
            version_id: 1,
            slot_name: slot.to_string(),
            mapping_json: json.to_string(),
            order_id: order,
            hash: format!("hash-{}", order),
        }
    }

    #[test]
    fn rows_are_ordered_by_order_id() {
        let table = PartnerSlotMappings::from_rows(vec![
            row("b@.*", 2, "{}"),
            row("a@.*", 1, "{}"),
            row("c@.*", 3, "{}"),
        ]);
        assert_eq!(table.info.ordered_slot_list, vec!["a@.*", "b@.*", "c@.*"]);
        assert_eq!(table.info.hash_value_map["b@.*"], "hash-2");
    }

    #[test]
    fn invalid_json_rows_are_skipped() {
        let table = PartnerSlotMappings::from_rows(vec![row("a", 1, "not json"), row("b", 2, "{\"k\":1}")]);
        assert!(table.get("a").is_none());
        assert!(table.get("B").is_some());
        assert_eq!(table.info.ordered_slot_list, vec!["b"]);
    }

    #[test]
    fn outgoing_params_drop_reserved_keys() {
        let table = PartnerSlotMappings::from_rows(vec![row(
            "/1/Unit@300x250",
            1,
            r#"{"site":"1","owSlotName":"/1/Unit@300x250","slotName":"sec"}"#,
        )]);
        let mapping = table.get("/1/unit@300x250").unwrap();
        assert_eq!(mapping.secondary_name.as_deref(), Some("sec"));
        let params = mapping.outgoing_params();
        assert_eq!(params.len(), 1);
        assert!(params.contains_key("site"));
    }
}
