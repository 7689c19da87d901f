// src/slot/vast.rs

use serde_json::{json, Value};
use std::collections::HashMap;

use crate::error::ResolveError;
use crate::model::context::RequestCtx;
use crate::model::placements::{PartnerSlotMappings, VastTag};
use crate::openrtb::request::Imp;
use crate::slot::key::candidate_keys;
use crate::slot::resolver::SlotResolver;

/// VAST 标签校验所用的时长边界。`pod_duration` 为 0 表示非 pod 请求
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VastDurationBounds {
    pub min_duration: i64,
    pub max_duration: i64,
    pub pod_duration: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VastResolution {
    /// 主候选 key
    pub slot_key: String,
    /// 命中的目录条目（DB slot 名称）
    pub matched_keys: Vec<String>,
    pub tag_ids: Vec<i32>,
    /// `{"tags":[{tagid,url,dur,price,params}]}`
    pub params: Value,
}

pub fn validate_vast_tag(tag: &VastTag, bounds: &VastDurationBounds) -> Result<(), String> {
    if tag.url.is_empty() {
        return Err(format!("VAST tag mandatory parameter 'url' missing: {}", tag.id));
    }
    if tag.duration <= 0 {
        return Err(format!("VAST tag mandatory parameter 'duration' missing: {}", tag.id));
    }
    if bounds.max_duration != 0 && tag.duration > bounds.max_duration {
        return Err(format!(
            "VAST tag {} duration {} exceeds video.maxduration {}",
            tag.id, tag.duration, bounds.max_duration
        ));
    }
    if bounds.pod_duration == 0 {
        if bounds.min_duration != 0 && tag.duration < bounds.min_duration {
            return Err(format!(
                "VAST tag {} duration {} below video.minduration {}",
                tag.id, tag.duration, bounds.min_duration
            ));
        }
    } else if tag.duration > bounds.pod_duration {
        return Err(format!(
            "VAST tag {} duration {} exceeds pod duration {}",
            tag.id, tag.duration, bounds.pod_duration
        ));
    }
    Ok(())
}

/// 广告单元部分小写，其余部分保持原样
fn case_insensitive_key(key: &str) -> String {
    match key.find('@') {
        Some(idx) => format!("{}{}", key[..idx].to_lowercase(), &key[idx..]),
        None => key.to_string(),
    }
}

/// 返回与 slot key 匹配且通过校验的目录条目。
/// 没有真实命中时退回默认 bundle（`adunit@@tagid`）条目；
/// 全部为空且存在校验失败时返回 InvalidVastTag。
pub fn matched_vast_slot_keys(
    slot_key: &str,
    mappings: &PartnerSlotMappings,
    tags: &HashMap<i32, VastTag>,
    bounds: &VastDurationBounds,
) -> Result<Vec<(String, i32)>, ResolveError> {
    let request_key = case_insensitive_key(slot_key);
    let mut matched = Vec::new();
    let mut defaults = Vec::new();
    let mut failures = Vec::new();

    for slot_name in &mappings.info.ordered_slot_list {
        let key = case_insensitive_key(slot_name);
        let (prefix_len, is_default) = match key.find("@@") {
            Some(idx) => {
                if !request_key.starts_with(&key[..idx + 1]) {
                    continue;
                }
                (idx + 2, true)
            }
            None => {
                if !key.starts_with(&request_key) {
                    continue;
                }
                (request_key.len(), false)
            }
        };

        let tag_id: i32 = match key[prefix_len..].parse() {
            Ok(id) if id != 0 => id,
            _ => continue,
        };
        let Some(tag) = tags.get(&tag_id) else {
            continue;
        };
        if let Err(reason) = validate_vast_tag(tag, bounds) {
            failures.push(reason);
            continue;
        }

        if is_default {
            defaults.push((slot_name.clone(), tag_id));
        } else {
            matched.push((slot_name.clone(), tag_id));
        }
    }

    if matched.is_empty() && defaults.is_empty() && !failures.is_empty() {
        return Err(ResolveError::InvalidVastTag {
            slot: slot_key.to_string(),
            reasons: failures.join("; "),
        });
    }
    if matched.is_empty() {
        return Ok(defaults);
    }
    Ok(matched)
}

pub fn vast_bidder_params(
    matched: &[(String, i32)],
    mappings: &PartnerSlotMappings,
    tags: &HashMap<i32, VastTag>,
) -> Value {
    let entries: Vec<Value> = matched
        .iter()
        .filter_map(|(slot_name, tag_id)| {
            let tag = tags.get(tag_id)?;
            let params = mappings
                .get(slot_name)
                .map(|m| Value::Object(m.outgoing_params()))
                .unwrap_or_else(|| json!({}));
            Some(json!({
                "tagid": tag_id.to_string(),
                "url": tag.url,
                "dur": tag.duration,
                "price": tag.price,
                "params": params,
            }))
        })
        .collect();
    json!({ "tags": entries })
}

impl SlotResolver {
    /// VAST bidder 的参数解析。没有 video、没有候选 key 或目录为空时返回 None
    pub fn resolve_vast(
        &self,
        ctx: &RequestCtx,
        partner_id: i32,
        imp: &Imp,
        mappings: &PartnerSlotMappings,
        tags: &HashMap<i32, VastTag>,
        bounds: &VastDurationBounds,
    ) -> Result<Option<VastResolution>, ResolveError> {
        let partner = self.partner(ctx, partner_id)?;
        if imp.video.is_none() || tags.is_empty() {
            return Ok(None);
        }
        let Some(slot_key) = candidate_keys(imp, &partner.key_gen_pattern, &ctx.source)
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        let matched = matched_vast_slot_keys(&slot_key, mappings, tags, bounds)?;
        if matched.is_empty() {
            return Ok(None);
        }
        Ok(Some(VastResolution {
            params: vast_bidder_params(&matched, mappings, tags),
            tag_ids: matched.iter().map(|(_, id)| *id).collect(),
            matched_keys: matched.into_iter().map(|(k, _)| k).collect(),
            slot_key,
        }))
    }
}
