// src/feature/random.rs

use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 加权随机判定使用的随机源，测试中可替换为确定性实现
pub trait RandomSource: Send + Sync {
    /// 返回 [0, upper) 范围内的整数
    fn draw(&self, upper: u32) -> u32;
}

/// 百分比判定：draw(100) < threshold。100 恒为真，0 恒为假
pub fn predict(rng: &dyn RandomSource, threshold: i32) -> bool {
    if threshold <= 0 {
        return false;
    }
    (rng.draw(100) as i32) < threshold
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn draw(&self, upper: u32) -> u32 {
        if upper == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..upper)
    }
}

/// 固定返回同一个值（超出范围时取 upper - 1）
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub u32);

impl RandomSource for FixedRandom {
    fn draw(&self, upper: u32) -> u32 {
        self.0.min(upper.saturating_sub(1))
    }
}

/// 按给定序列循环返回
#[derive(Debug)]
pub struct SequenceRandom {
    values: Mutex<Vec<u32>>,
    cursor: AtomicUsize,
}

impl SequenceRandom {
    pub fn new(values: Vec<u32>) -> Self {
        Self {
            values: Mutex::new(values),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl RandomSource for SequenceRandom {
    fn draw(&self, upper: u32) -> u32 {
        let values = self.values.lock();
        if values.is_empty() {
            return 0;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % values.len();
        values[idx].min(upper.saturating_sub(1))
    }
}
