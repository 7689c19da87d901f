// src/adpod/impressions.rs

use tracing::debug;

use crate::adpod::ext::{DurationMatching, DynamicPodConfig};

/// 内部计算时把时长对齐到该值的倍数
pub const DEFAULT_MULTIPLE_OF: i64 = 5;

/// 生成展示机会的时长区间 (min, max)
pub type DurationRange = (i64, i64);

/// 按配置选择算法生成展示机会。通过约束校验的 pod 总能得到至少 minads 个展示机会，
/// 否则结果不满足约束时返回空列表
pub fn generate(config: &DynamicPodConfig, multiple_of: i64) -> Vec<DurationRange> {
    let ranges = if config.uses_duration_ranges() {
        by_duration_ranges(config)
    } else {
        min_max(config, multiple_of)
    };

    if satisfies_constraints(config, &ranges) {
        debug!(
            impressions = ranges.len(),
            pod_max_duration = config.pod_max_duration,
            "adpod impressions generated"
        );
        ranges
    } else {
        debug!(?ranges, "generated impressions violate pod constraints");
        Vec::new()
    }
}

fn satisfies_constraints(config: &DynamicPodConfig, ranges: &[DurationRange]) -> bool {
    let count = ranges.len() as i64;
    count >= config.min_ads
        && count <= config.max_ads
        && ranges.iter().all(|(min, max)| {
            min <= max && *min >= config.min_duration && *max <= config.max_duration
        })
}

/// 每个合法时长生成一个展示机会，按循环补足到 maxads。
/// roundup 策略下最短时长取合法时长中的最小值，exact 策略下 min = max。
fn by_duration_ranges(config: &DynamicPodConfig) -> Vec<DurationRange> {
    let valid: Vec<i64> = config
        .durations
        .iter()
        .copied()
        .filter(|d| (config.min_duration..=config.max_duration).contains(d))
        .collect();
    let Some(smallest) = valid.iter().copied().min() else {
        return Vec::new();
    };

    let roundup = config.matching == Some(DurationMatching::Roundup);
    let target = config.max_ads.max(0) as usize;
    valid
        .iter()
        .map(|&d| if roundup { (smallest, d) } else { (d, d) })
        .cycle()
        .take(target)
        .collect()
}

/// 五组 (pod 时长, 广告数) 组合分别跑一遍分配，同一时长区间取各组中的最大重复次数后合并。
/// 合并结果截断到 maxads；全部组合都无解而 pod 本身合法时退回均分方案。
fn min_max(config: &DynamicPodConfig, multiple_of: i64) -> Vec<DurationRange> {
    let (pod_min, pod_max) = (config.pod_min_duration, config.pod_max_duration);
    let (min_ads, max_ads) = (config.min_ads, config.max_ads);
    let variants = [
        (pod_min, pod_max, min_ads, max_ads),
        (pod_max, pod_max, max_ads, max_ads),
        (pod_max, pod_max, min_ads, min_ads),
        (pod_min, pod_min, max_ads, max_ads),
        (pod_min, pod_min, min_ads, min_ads),
    ];

    let mut repeats: Vec<(DurationRange, usize)> = Vec::new();
    for (pod_min, pod_max, min_ads, max_ads) in variants {
        let bounds = PodBounds {
            min_ads,
            max_ads,
            slot_min: config.min_duration,
            slot_max: config.max_duration,
            pod_min,
            pod_max,
        };
        let slots = MinMaxGenerator::new(bounds, multiple_of).generate();
        let mut counts: Vec<(DurationRange, usize)> = Vec::new();
        for slot in slots {
            match counts.iter_mut().find(|(range, _)| *range == slot) {
                Some((_, n)) => *n += 1,
                None => counts.push((slot, 1)),
            }
        }
        for (range, n) in counts {
            match repeats.iter_mut().find(|(r, _)| *r == range) {
                Some((_, max)) => *max = (*max).max(n),
                None => repeats.push((range, n)),
            }
        }
    }

    let mut ranges: Vec<DurationRange> = repeats
        .into_iter()
        .flat_map(|(range, n)| std::iter::repeat(range).take(n))
        .collect();
    if pod_min != pod_max {
        apply_min_duration(config, &mut ranges);
    }
    ranges.truncate(max_ads.max(0) as usize);

    if satisfies_constraints(config, &ranges) || config.validate().is_err() {
        return ranges;
    }
    debug!(min_ads, max_ads, pod_max, "min-max generation empty, splitting pod budget evenly");
    even_split(config)
}

/// pod 时长为区间时，最短时长取 round(pod 最短时长 / minads)，超出 [slot 最短, 本区间最长] 时用 slot 最短时长
fn apply_min_duration(config: &DynamicPodConfig, ranges: &mut [DurationRange]) {
    let min_duration = (config.pod_min_duration as f64 / config.min_ads.max(1) as f64).round() as i64;
    for (min, max) in ranges.iter_mut() {
        *min = if min_duration >= config.min_duration && min_duration <= *max {
            min_duration
        } else {
            config.min_duration
        };
    }
}

/// minads 个展示机会平分 pod 最大时长，每个区间落在 [minduration, maxduration] 内
fn even_split(config: &DynamicPodConfig) -> Vec<DurationRange> {
    let count = config.min_ads.max(1);
    let max = (config.pod_max_duration / count)
        .min(config.max_duration)
        .max(config.min_duration)
        .max(1);
    vec![(config.min_duration, max); count as usize]
}

fn closest_factor(num: i64, multiple_of: i64) -> i64 {
    ((num as f64 / multiple_of as f64).round() * multiple_of as f64) as i64
}

/// 不小于 min 的最近倍数（0 时取 multiple_of）
fn closest_factor_for_min(min: i64, multiple_of: i64) -> i64 {
    let closest = closest_factor(min, multiple_of);
    if closest == 0 {
        multiple_of
    } else if closest < min {
        closest + multiple_of
    } else {
        closest
    }
}

/// 不大于 max 的最近倍数（为 0 时保留原值）
fn closest_factor_for_max(max: i64, multiple_of: i64) -> i64 {
    if closest_factor(max, multiple_of) == max {
        return max;
    }
    let floor = (max / multiple_of) * multiple_of;
    if floor == 0 {
        max
    } else {
        floor
    }
}

fn least_time_value(time: i64, least_required_by_slot: i64, multiple_of: i64) -> i64 {
    let mut value = time;
    if multiple_of < value {
        value = multiple_of;
    }
    if least_required_by_slot > 0 && least_required_by_slot < value {
        value = least_required_by_slot;
    }
    value
}

#[derive(Debug, Clone, Copy)]
struct PodBounds {
    min_ads: i64,
    max_ads: i64,
    slot_min: i64,
    slot_max: i64,
    pod_min: i64,
    pod_max: i64,
}

/// 每个展示机会的时长按 multiple_of 递增分配，直到 pod 最大时长耗尽或所有 slot 已满
struct MinMaxGenerator {
    requested: PodBounds,
    /// 对齐到倍数后的内部取值，只用于计算
    internal: PodBounds,
    multiple_of: i64,
    /// pod 时长为区间时，slot 最短时长使用请求值
    min_from_request: bool,
    slots: Vec<DurationRange>,
    total_slot_max_time: i64,
    slots_with_zero_time: i64,
}

/// 连续多少轮没有分配到时间就停止
const MAX_STALLED_ROUNDS: u32 = 4;

impl MinMaxGenerator {
    fn new(requested: PodBounds, multiple_of: i64) -> Self {
        let multiple_of = multiple_of.max(1);

        let mut internal = requested;
        if requested.pod_min != requested.pod_max {
            internal.pod_min = closest_factor_for_min(requested.pod_min, multiple_of);
            internal.pod_max = closest_factor_for_max(requested.pod_max, multiple_of);
        }
        if requested.slot_min != requested.slot_max {
            internal.slot_min = closest_factor_for_min(requested.slot_min, multiple_of);
            internal.slot_max = closest_factor_for_max(requested.slot_max, multiple_of);
            if internal.slot_min > internal.slot_max {
                internal.slot_min = requested.slot_min;
                internal.slot_max = requested.slot_max;
            }
        }

        Self {
            requested,
            internal,
            multiple_of,
            min_from_request: requested.pod_min != requested.pod_max,
            slots: Vec::new(),
            total_slot_max_time: 0,
            slots_with_zero_time: 0,
        }
    }

    fn total_ads(&self) -> i64 {
        if self.internal.slot_max <= 0 || self.internal.slot_min <= 0 {
            return 0;
        }
        let by_max = self.internal.pod_max / self.internal.slot_max;
        let by_min = self.internal.pod_max / self.internal.slot_min;
        by_max
            .max(by_min)
            .max(self.requested.min_ads)
            .min(self.requested.max_ads)
    }

    fn time_for_each_slot(&self, total_ads: i64) -> i64 {
        if total_ads <= 0 {
            return 0;
        }
        let time = (self.internal.pod_max / total_ads)
            .max(self.internal.slot_min)
            .min(self.internal.slot_max);

        if self.requested.slot_min == self.requested.slot_max {
            return time;
        }
        if time * total_ads > self.requested.pod_max {
            return self.internal.pod_max / total_ads;
        }
        if time % self.multiple_of != 0 {
            return closest_factor(time, self.multiple_of);
        }
        time
    }

    fn generate(mut self) -> Vec<DurationRange> {
        let total_ads = self.total_ads();
        let mut time_for_each_slot = self.time_for_each_slot(total_ads);
        self.slots = vec![(0, 0); total_ads.max(0) as usize];
        self.slots_with_zero_time = total_ads;

        let mut time = 0;
        let mut fill_zero_slots_first = true;
        let mut zero_slots_filled_by_last_run = 0;
        let mut stalled = 0;
        while time < self.requested.pod_max {
            let (adjusted, slots_full) = self.add_time(time_for_each_slot, fill_zero_slots_first);
            time += adjusted;
            time_for_each_slot = least_time_value(
                self.requested.pod_max - time,
                self.requested.slot_max - time_for_each_slot,
                self.multiple_of,
            );
            if slots_full {
                break;
            }
            if adjusted == 0 {
                stalled += 1;
                if stalled >= MAX_STALLED_ROUNDS {
                    break;
                }
            } else {
                stalled = 0;
            }

            // minads == maxads 时优先填充仍为 0 的 slot
            zero_slots_filled_by_last_run = self.slots_with_zero_time - zero_slots_filled_by_last_run;
            fill_zero_slots_first = self.requested.min_ads == self.requested.max_ads
                && self.slots_with_zero_time > 0
                && zero_slots_filled_by_last_run > 0;
        }

        self.validate_slots()
    }

    /// 返回本轮分配的总时长，以及是否所有 slot 都已满
    fn add_time(&mut self, time_for_each_slot: i64, fill_zero_slots_first: bool) -> (i64, bool) {
        let mut added = 0;
        let mut full = 0;
        for i in 0..self.slots.len() {
            let current_max = self.slots[i].1;
            let next_max = current_max + time_for_each_slot;
            let can_adjust = next_max <= self.requested.slot_max && next_max >= self.requested.slot_min;
            let within_pod = self.total_slot_max_time + time_for_each_slot <= self.requested.pod_max;
            let allowed = !fill_zero_slots_first || current_max == 0;

            if current_max <= self.internal.slot_max && can_adjust && within_pod && allowed {
                let slot = &mut self.slots[i];
                slot.0 += time_for_each_slot;
                if time_for_each_slot < self.multiple_of || self.min_from_request {
                    slot.0 = self.requested.slot_min;
                }
                if current_max == 0 {
                    self.slots_with_zero_time -= 1;
                }
                slot.1 = next_max;
                self.total_slot_max_time += time_for_each_slot;
                added += time_for_each_slot;
            }

            if self.slots[i].1 == self.requested.slot_max || !can_adjust {
                full += 1;
            }
        }
        (added, full == self.slots.len())
    }

    /// 去掉未分配时间的 slot，校验数量、单个时长与总时长；任一失败返回空
    fn validate_slots(mut self) -> Vec<DurationRange> {
        self.slots.retain(|(_, max)| *max != 0);
        if self.slots.is_empty() {
            return Vec::new();
        }

        let requested = self.requested;
        let count = self.slots.len() as i64;
        let slot_ok = |d: i64| d >= requested.slot_min && d <= requested.slot_max;
        let mut valid = count >= requested.min_ads
            && count <= requested.max_ads
            && self.slots.iter().all(|(min, max)| slot_ok(*min) && slot_ok(*max));

        let total = self.total_slot_max_time;
        if requested.pod_min == requested.pod_max {
            valid = valid && total == requested.pod_max;
        }
        valid = valid && total >= requested.pod_min && total <= requested.pod_max;

        if valid {
            self.slots
        } else {
            Vec::new()
        }
    }
}
