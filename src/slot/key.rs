// src/slot/key.rs

use crate::model::placements::{ADUNIT_SIZE_REGEX_KGP, REGEX_KGP};
use crate::openrtb::request::Imp;

/// video / native 没有真实尺寸，使用固定占位尺寸 (w, h)
pub const VIDEO_SIZE: (i64, i64) = (0, 0);
pub const NATIVE_SIZE: (i64, i64) = (1, 1);

const SIZE_TOKEN: &str = "@_W_x_H_";

/// 按 key 生成模板拼出 slot 名称；未知模板返回 None
pub fn generate_slot_name(w: i64, h: i64, kgp: &str, tag_id: &str, div: &str, source: &str) -> Option<String> {
    let name = match kgp {
        "_AU_" | "_RE_" => tag_id.to_string(),
        "_DIV_" => div.to_string(),
        "_W_x_H_" => format!("{}x{}", w, h),
        "_AU_@_DIV_" => format!("{}@{}", tag_id, div),
        "_AU_@_W_x_H_" | ADUNIT_SIZE_REGEX_KGP => format!("{}@{}x{}", tag_id, w, h),
        "_DIV_@_W_x_H_" => format!("{}@{}x{}", div, w, h),
        "_W_x_H_@_W_x_H_" => format!("{}x{}@{}x{}", w, h, w, h),
        REGEX_KGP => format!("{}@{}@{}x{}", tag_id, div, w, h),
        // VAST 目录 key 为 `adunit@source@<tagid>`，这里只生成前缀
        "_AU_@_SRC_@_VASTTAG_" => format!("{}@{}@", tag_id, source),
        _ => return None,
    };
    Some(name)
}

/// 展示机会的全部尺寸：banner 主尺寸、各 format、video 占位、native 占位
pub fn impression_sizes(imp: &Imp) -> Vec<(i64, i64)> {
    let mut sizes = Vec::new();
    if let Some(banner) = &imp.banner {
        if let (Some(w), Some(h)) = (banner.w, banner.h) {
            sizes.push((w, h));
        }
        sizes.extend(banner.format.iter().map(|f| (f.w, f.h)));
    }
    if imp.video.is_some() {
        sizes.push(VIDEO_SIZE);
    }
    if imp.native.is_some() {
        sizes.push(NATIVE_SIZE);
    }
    sizes
}

/// 有序候选 key 列表，第一个为主 key
pub fn candidate_keys(imp: &Imp, kgp: &str, source: &str) -> Vec<String> {
    let tag_id = imp.tagid.clone().unwrap_or_default();
    let div = imp.wrapper_div();
    impression_sizes(imp)
        .into_iter()
        .filter_map(|(w, h)| generate_slot_name(w, h, kgp, &tag_id, &div, source))
        .filter(|slot| !slot.is_empty())
        .collect()
}

/// 默认映射使用的模板：去掉尺寸部分
pub fn default_kgp(kgp: &str) -> String {
    if kgp.contains(SIZE_TOKEN) {
        kgp.replace(SIZE_TOKEN, "")
    } else {
        kgp.to_string()
    }
}

/// 默认映射下的 slot 名称（尽力而为）
pub fn default_slot_name(imp: &Imp, kgp: &str, source: &str) -> String {
    let tag_id = imp.tagid.clone().unwrap_or_default();
    let div = imp.wrapper_div();
    let (w, h) = impression_sizes(imp).first().copied().unwrap_or(VIDEO_SIZE);
    generate_slot_name(w, h, &default_kgp(kgp), &tag_id, &div, source).unwrap_or(tag_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openrtb::request::{Banner, Format, Video};
    use serde_json::json;

    fn banner_imp() -> Imp {
        Imp {
            id: "imp1".to_string(),
            tagid: Some("/43743431/DMDEMO1".to_string()),
            banner: Some(Banner {
                w: Some(200),
                h: Some(300),
                format: vec![Format { w: 728, h: 90 }],
            }),
            ext: Some(json!({"wrapper": {"div": "div1"}})),
            ..Default::default()
        }
    }

    #[test]
    fn candidates_follow_size_order() {
        let keys = candidate_keys(&banner_imp(), "_AU_@_W_x_H_", "example.com");
        assert_eq!(keys, vec!["/43743431/DMDEMO1@200x300", "/43743431/DMDEMO1@728x90"]);
    }

    #[test]
    fn video_and_native_use_sentinel_sizes() {
        let imp = Imp {
            id: "imp1".to_string(),
            tagid: Some("au".to_string()),
            video: Some(Video::default()),
            native: Some(Default::default()),
            ..Default::default()
        };
        assert_eq!(candidate_keys(&imp, "_AU_@_W_x_H_", ""), vec!["au@0x0", "au@1x1"]);
    }

    #[test]
    fn patterns_render_their_placeholders() {
        assert_eq!(generate_slot_name(300, 250, "_DIV_", "au", "d", "s").as_deref(), Some("d"));
        assert_eq!(generate_slot_name(300, 250, "_W_x_H_@_W_x_H_", "au", "d", "s").as_deref(), Some("300x250@300x250"));
        assert_eq!(generate_slot_name(300, 250, REGEX_KGP, "au", "d", "s").as_deref(), Some("au@d@300x250"));
        assert_eq!(generate_slot_name(300, 250, ADUNIT_SIZE_REGEX_KGP, "au", "d", "s").as_deref(), Some("au@300x250"));
        assert_eq!(generate_slot_name(0, 0, "_AU_@_SRC_@_VASTTAG_", "au", "d", "app.bundle").as_deref(), Some("au@app.bundle@"));
        assert_eq!(generate_slot_name(0, 0, "_UNKNOWN_", "au", "d", "s"), None);
    }

    #[test]
    fn default_mapping_strips_size() {
        assert_eq!(default_kgp("_AU_@_DIV_@_W_x_H_"), "_AU_@_DIV_");
        assert_eq!(default_kgp("_AU_"), "_AU_");
        assert_eq!(default_slot_name(&banner_imp(), "_AU_@_W_x_H_", ""), "/43743431/DMDEMO1");
        assert_eq!(default_slot_name(&banner_imp(), REGEX_KGP, ""), "/43743431/DMDEMO1@div1");
    }
}
