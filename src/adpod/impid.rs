// src/adpod/impid.rs

use crate::error::PodError;

/// 生成展示机会 ID 的分隔符：`{原始 imp id}::{pod id}::{序号}`
pub const IMP_ID_SEPARATOR: &str = "::";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImpId {
    pub original_imp_id: String,
    pub pod_id: String,
    pub sequence: usize,
}

/// pod id 不能包含分隔符，也不能以 `:` 开头，否则无法从右侧唯一拆分
pub fn validate_pod_id(pod_id: &str) -> Result<(), PodError> {
    if pod_id.contains(IMP_ID_SEPARATOR) || pod_id.starts_with(':') {
        return Err(PodError::InvalidPodId {
            pod_id: pod_id.to_string(),
            separator: IMP_ID_SEPARATOR,
        });
    }
    Ok(())
}

pub fn encode(original_imp_id: &str, pod_id: &str, sequence: usize) -> String {
    format!(
        "{}{sep}{}{sep}{}",
        original_imp_id,
        pod_id,
        sequence,
        sep = IMP_ID_SEPARATOR
    )
}

/// 从右向左拆分，原始 imp id 中允许出现分隔符
pub fn decode(imp_id: &str) -> Option<DecodedImpId> {
    let mut parts = imp_id.rsplitn(3, IMP_ID_SEPARATOR);
    let sequence = parts.next()?.parse().ok()?;
    let pod_id = parts.next()?;
    let original_imp_id = parts.next()?;
    Some(DecodedImpId {
        original_imp_id: original_imp_id.to_string(),
        pod_id: pod_id.to_string(),
        sequence,
    })
}
