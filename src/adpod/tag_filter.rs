// src/adpod/tag_filter.rs

use serde_json::Value;
use std::collections::BTreeMap;

use crate::openrtb::request::Imp;

/// bidder code -> 被过滤掉的 VAST 标签 ID
pub type BlockedTags = BTreeMap<String, Vec<String>>;

fn tag_id(tag: &Value) -> Option<String> {
    match tag.get("tagid")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// 按生成展示机会的时长区间过滤 `imp.ext.bidder.<code>.tags`。
/// 过滤后列表为空的 bidder 从该展示机会中移除。
pub fn filter_vast_tags(imp: &mut Imp, min_duration: i64, max_duration: i64) -> BlockedTags {
    let mut blocked = BlockedTags::new();
    let Some(bidders) = imp.bidder_params_mut() else {
        return blocked;
    };

    let mut emptied = Vec::new();
    for (bidder, params) in bidders.iter_mut() {
        let Some(tags) = params.get_mut("tags").and_then(Value::as_array_mut) else {
            continue;
        };
        if tags.is_empty() {
            continue;
        }
        tags.retain(|tag| {
            let duration = tag.get("dur").and_then(Value::as_i64).unwrap_or(0);
            let keep = duration >= min_duration && duration <= max_duration;
            if !keep {
                if let Some(id) = tag_id(tag) {
                    blocked.entry(bidder.clone()).or_default().push(id);
                }
            }
            keep
        });
        if tags.is_empty() {
            emptied.push(bidder.clone());
        }
    }

    for bidder in emptied {
        bidders.remove(&bidder);
    }
    blocked
}

/// 合并多个展示机会的过滤结果
pub fn merge_blocked(into: &mut BlockedTags, from: BlockedTags) {
    for (bidder, ids) in from {
        let entry = into.entry(bidder).or_default();
        for id in ids {
            if !entry.contains(&id) {
                entry.push(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn imp_with_tags() -> Imp {
        let mut imp = Imp { id: "imp1::imp1::1".to_string(), ..Default::default() };
        imp.set_bidder_params(
            "vastbidder",
            json!({"tags": [
                {"tagid": "101", "dur": 15},
                {"tagid": "102", "dur": 45},
                {"tagid": 103, "dur": 25}
            ]}),
        );
        imp.set_bidder_params("spotx", json!({"tags": [{"tagid": "201", "dur": 60}]}));
        imp.set_bidder_params("pubmatic", json!({"adSlot": "a@0x0"}));
        imp
    }

    #[test]
    fn out_of_range_tags_are_dropped_and_recorded() {
        let mut imp = imp_with_tags();
        let blocked = filter_vast_tags(&mut imp, 10, 30);

        let tags = imp.bidder_params("vastbidder").unwrap()["tags"].as_array().unwrap().clone();
        let ids: Vec<String> = tags.iter().filter_map(tag_id).collect();
        assert_eq!(ids, vec!["101", "103"]);
        assert_eq!(blocked.get("vastbidder"), Some(&vec!["102".to_string()]));
        assert_eq!(blocked.get("spotx"), Some(&vec!["201".to_string()]));
    }

    #[test]
    fn bidder_with_no_remaining_tags_is_removed() {
        let mut imp = imp_with_tags();
        filter_vast_tags(&mut imp, 10, 30);
        assert!(imp.bidder_params("spotx").is_none());
        assert!(imp.bidder_params("pubmatic").is_some());
    }

    #[test]
    fn merged_blocked_ids_are_unique() {
        let mut all = BlockedTags::new();
        merge_blocked(&mut all, BTreeMap::from([("b".to_string(), vec!["1".to_string()])]));
        merge_blocked(&mut all, BTreeMap::from([("b".to_string(), vec!["1".to_string(), "2".to_string()])]));
        assert_eq!(all["b"], vec!["1", "2"]);
    }
}
