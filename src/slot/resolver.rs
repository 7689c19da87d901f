// src/slot/resolver.rs

use regex::RegexBuilder;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::error::ResolveError;
use crate::model::context::RequestCtx;
use crate::model::placements::{PartnerConfig, PartnerSlotMappings};
use crate::openrtb::request::Imp;
use crate::slot::cache::{RegexCacheKey, RegexSlotCache, RegexSlotEntry};
use crate::slot::key::{candidate_keys, default_slot_name};

/// 下发给 bidder 的 slot 参数键
pub const KEY_AD_SLOT: &str = "adSlot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Regex,
    Default,
}

/// 一次解析的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSlot {
    pub kind: MatchKind,
    /// 命中的候选 key（默认映射时为生成的默认名称）
    pub matched_slot: String,
    pub matched_pattern: Option<String>,
    /// 下发的 slot 名称
    pub slot_name: String,
    /// 正则命中时的 hash，同时作为生成展示机会的 tagid
    pub tag_id: Option<String>,
    pub params: Map<String, Value>,
}

/// 广告位与 bidder 参数解析引擎。正则命中缓存在所有请求间共享
#[derive(Debug, Default, Clone)]
pub struct SlotResolver {
    cache: Arc<RegexSlotCache>,
}

impl SlotResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(cache: Arc<RegexSlotCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &RegexSlotCache {
        &self.cache
    }

    pub(crate) fn partner<'a>(&self, ctx: &'a RequestCtx, partner_id: i32) -> Result<&'a PartnerConfig, ResolveError> {
        ctx.partner_configs
            .get(&partner_id)
            .ok_or(ResolveError::MissingPartnerConfig { partner_id })
    }

    /// 解析展示机会在某个 partner 下的参数：精确匹配、正则匹配、默认映射依次尝试
    pub fn resolve(
        &self,
        ctx: &RequestCtx,
        partner_id: i32,
        imp: &Imp,
        mappings: &PartnerSlotMappings,
    ) -> Result<ResolvedSlot, ResolveError> {
        let partner = self.partner(ctx, partner_id)?;
        let is_regex = partner.is_regex_kgp();

        for slot in candidate_keys(imp, &partner.key_gen_pattern, &ctx.source) {
            if let Some(resolved) = self.resolve_candidate(ctx, partner_id, &slot, mappings, is_regex) {
                return Ok(resolved);
            }
        }

        let slot_name = default_slot_name(imp, &partner.key_gen_pattern, &ctx.source);
        debug!(partner_id, slot = %slot_name, "no slot mapping matched, using default mapping");
        let mut params = Map::new();
        params.insert(KEY_AD_SLOT.to_string(), Value::String(slot_name.clone()));
        Ok(ResolvedSlot {
            kind: MatchKind::Default,
            matched_slot: slot_name.clone(),
            matched_pattern: None,
            slot_name,
            tag_id: None,
            params,
        })
    }

    fn resolve_candidate(
        &self,
        ctx: &RequestCtx,
        partner_id: i32,
        slot: &str,
        mappings: &PartnerSlotMappings,
        is_regex: bool,
    ) -> Option<ResolvedSlot> {
        if let Some(mapping) = mappings.get(slot) {
            let slot_name = mapping
                .secondary_name
                .clone()
                .or_else(|| mapping.alternate_name.clone())
                .unwrap_or_else(|| slot.to_string());
            let mut params = mapping.outgoing_params();
            params.insert(KEY_AD_SLOT.to_string(), Value::String(slot_name.clone()));
            return Some(ResolvedSlot {
                kind: MatchKind::Exact,
                matched_slot: slot.to_string(),
                matched_pattern: None,
                slot_name,
                tag_id: None,
                params,
            });
        }

        if !is_regex {
            return None;
        }

        let entry = self.regex_match(ctx, partner_id, slot, mappings)?;
        let mapping = mappings.get(&entry.matched_pattern)?;
        let hash = mappings
            .info
            .hash_value_map
            .get(&entry.matched_pattern)
            .filter(|h| !h.is_empty())
            .cloned();
        let slot_name = hash.clone().unwrap_or_else(|| entry.slot_name.clone());
        let mut params = mapping.outgoing_params();
        params.insert(KEY_AD_SLOT.to_string(), Value::String(slot_name.clone()));
        Some(ResolvedSlot {
            kind: MatchKind::Regex,
            matched_slot: entry.slot_name,
            matched_pattern: Some(entry.matched_pattern),
            slot_name,
            tag_id: hash,
            params,
        })
    }

    /// 按 DB 顺序逐个尝试正则模式，第一个完整命中的胜出；命中结果写入缓存
    pub fn regex_match(
        &self,
        ctx: &RequestCtx,
        partner_id: i32,
        slot: &str,
        mappings: &PartnerSlotMappings,
    ) -> Option<RegexSlotEntry> {
        let key = RegexCacheKey {
            pub_id: ctx.pub_id,
            profile_id: ctx.profile_id,
            display_version: ctx.display_version,
            partner_id,
            slot: slot.to_string(),
        };
        if let Some(entry) = self.cache.get(&key) {
            return Some(entry);
        }

        let slot_parts: Vec<&str> = slot.split('@').collect();
        for pattern in &mappings.info.ordered_slot_list {
            let pattern_parts: Vec<&str> = pattern.split('@').collect();
            if pattern_parts.len() != slot_parts.len() {
                continue;
            }
            if self.parts_match(pattern, &pattern_parts, &slot_parts) {
                let entry = RegexSlotEntry {
                    slot_name: slot.to_string(),
                    matched_pattern: pattern.clone(),
                };
                self.cache.insert(key, entry.clone());
                return Some(entry);
            }
        }
        None
    }

    fn parts_match(&self, pattern: &str, pattern_parts: &[&str], slot_parts: &[&str]) -> bool {
        for (pattern_part, slot_part) in pattern_parts.iter().zip(slot_parts) {
            self.cache.record_compilation();
            let re = match RegexBuilder::new(pattern_part).case_insensitive(true).build() {
                Ok(re) => re,
                Err(e) => {
                    debug!(pattern, error = %e, "skipping invalid slot pattern");
                    return false;
                }
            };
            let matched = re.find(slot_part).map_or(false, |m| !m.as_str().is_empty());
            if !matched && !slot_part.is_empty() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::placements::{SlotMappingRow, REGEX_KGP};
    use crate::openrtb::request::Banner;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Instant;

    fn ctx(kgp: &str) -> RequestCtx {
        RequestCtx {
            request_id: "req".to_string(),
            pub_id: 5890,
            profile_id: 123,
            display_version: 1,
            source: "example.com".to_string(),
            is_pod_request: false,
            partner_configs: HashMap::from([(
                8,
                PartnerConfig {
                    partner_id: 8,
                    bidder_code: "pubmatic".to_string(),
                    adapter_id: 1,
                    key_gen_pattern: kgp.to_string(),
                    timeout_ms: None,
                    extra: HashMap::new(),
                },
            )]),
            start_time: Instant::now(),
        }
    }

    fn row(slot: &str, order: i64, json: &str, hash: &str) -> SlotMappingRow {
        SlotMappingRow {
            partner_id: 8,
            adapter_id: 1,
            version_id: 1,
            slot_name: slot.to_string(),
            mapping_json: json.to_string(),
            order_id: order,
            hash: hash.to_string(),
        }
    }

    fn imp(tag: &str, w: i64, h: i64, div: &str) -> Imp {
        Imp {
            id: "imp1".to_string(),
            tagid: Some(tag.to_string()),
            banner: Some(Banner { w: Some(w), h: Some(h), format: vec![] }),
            ext: Some(json!({"wrapper": {"div": div}})),
            ..Default::default()
        }
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let mappings = PartnerSlotMappings::from_rows(vec![row(
            "/43743431/DMDemo1@200x300",
            1,
            r#"{"site":"12","adtag":"99"}"#,
            "",
        )]);
        let resolver = SlotResolver::new();
        let resolved = resolver
            .resolve(&ctx("_AU_@_W_x_H_"), 8, &imp("/43743431/DMDEMO1", 200, 300, ""), &mappings)
            .unwrap();
        assert_eq!(resolved.kind, MatchKind::Exact);
        assert_eq!(resolved.params["site"], json!("12"));
        assert_eq!(resolved.slot_name, "/43743431/DMDemo1@200x300");
        assert_eq!(resolver.cache().compilations(), 0);
    }

    #[test]
    fn secondary_name_wins_over_alternate_name() {
        let mappings = PartnerSlotMappings::from_rows(vec![row(
            "au@300x250",
            1,
            r#"{"owSlotName":"alt","slotName":"secondary","k":1}"#,
            "",
        )]);
        let resolved = SlotResolver::new()
            .resolve(&ctx("_AU_@_W_x_H_"), 8, &imp("au", 300, 250, ""), &mappings)
            .unwrap();
        assert_eq!(resolved.slot_name, "secondary");
        assert_eq!(resolved.params.get("owSlotName"), None);
        assert_eq!(resolved.params[KEY_AD_SLOT], json!("secondary"));
    }

    #[test]
    fn regex_patterns_follow_db_order() {
        let mappings = PartnerSlotMappings::from_rows(vec![
            row("^/43743431/.*@.*@.*$", 2, r#"{"p":"wide"}"#, "hash-wide"),
            row("^/43743431/DMDemo.*@div.*@300x250$", 1, r#"{"p":"narrow"}"#, "hash-narrow"),
        ]);
        let resolved = SlotResolver::new()
            .resolve(&ctx(REGEX_KGP), 8, &imp("/43743431/DMDemo7", 300, 250, "div9"), &mappings)
            .unwrap();
        assert_eq!(resolved.kind, MatchKind::Regex);
        assert_eq!(resolved.params["p"], json!("narrow"));
        assert_eq!(resolved.slot_name, "hash-narrow");
        assert_eq!(resolved.tag_id.as_deref(), Some("hash-narrow"));
    }

    #[test]
    fn cached_regex_lookup_compiles_nothing() {
        let mappings = PartnerSlotMappings::from_rows(vec![row("^au.*@.*@300x250$", 1, "{}", "h1")]);
        let resolver = SlotResolver::new();
        let ctx = ctx(REGEX_KGP);
        let imp = imp("au-1", 300, 250, "d");

        let first = resolver.resolve(&ctx, 8, &imp, &mappings).unwrap();
        let compiled = resolver.cache().compilations();
        assert!(compiled > 0);
        assert_eq!(resolver.cache().len(), 1);

        let second = resolver.resolve(&ctx, 8, &imp, &mappings).unwrap();
        assert_eq!(first, second);
        assert_eq!(resolver.cache().compilations(), compiled);
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let mappings = PartnerSlotMappings::from_rows(vec![
            row("([@.*@.*", 1, r#"{"p":"bad"}"#, "h-bad"),
            row("au@.*@.*", 2, r#"{"p":"good"}"#, "h-good"),
        ]);
        let resolved = SlotResolver::new()
            .resolve(&ctx(REGEX_KGP), 8, &imp("au", 300, 250, "d"), &mappings)
            .unwrap();
        assert_eq!(resolved.params["p"], json!("good"));
    }

    #[test]
    fn no_match_falls_back_to_default_mapping() {
        let mappings = PartnerSlotMappings::from_rows(vec![row("other@1x1", 1, "{}", "")]);
        let resolved = SlotResolver::new()
            .resolve(&ctx("_AU_@_W_x_H_"), 8, &imp("au", 300, 250, ""), &mappings)
            .unwrap();
        assert_eq!(resolved.kind, MatchKind::Default);
        assert_eq!(resolved.slot_name, "au");
        assert_eq!(resolved.params[KEY_AD_SLOT], json!("au"));
    }

    #[test]
    fn missing_partner_is_an_error() {
        let err = SlotResolver::new()
            .resolve(&ctx("_AU_"), 9, &imp("au", 1, 1, ""), &PartnerSlotMappings::default())
            .unwrap_err();
        assert_eq!(err, ResolveError::MissingPartnerConfig { partner_id: 9 });
    }
}
