// src/feature/snapshot.rs

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// 双缓冲快照：两个不可变实例加一个活动下标。
/// 写入方先完整构建新值，写入非活动槽位，再一次性翻转下标；
/// 读取方只克隆活动槽位的 Arc，永远看不到半成品。
pub struct DoubleBuffer<T> {
    slots: [RwLock<Arc<T>>; 2],
    active: AtomicUsize,
    generation: AtomicU64,
    writer: Mutex<()>,
}

impl<T> DoubleBuffer<T> {
    pub fn new(initial: T) -> Self {
        let initial = Arc::new(initial);
        Self {
            slots: [RwLock::new(Arc::clone(&initial)), RwLock::new(initial)],
            active: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    /// 读取当前活动的完整值
    pub fn load(&self) -> Arc<T> {
        let idx = self.active.load(Ordering::Acquire);
        Arc::clone(&self.slots[idx].read())
    }

    /// 发布新值
    pub fn publish(&self, value: T) {
        let _writer = self.writer.lock();
        let next = self.active.load(Ordering::Acquire) ^ 1;
        *self.slots[next].write() = Arc::new(value);
        self.active.store(next, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// 基于当前值构建并发布新值
    pub fn update<F>(&self, build: F)
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.load();
        self.publish(build(&current));
    }

    /// 已发布次数
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl<T: Default> Default for DoubleBuffer<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn publish_flips_to_the_new_value() {
        let buffer = DoubleBuffer::new(vec![1, 2]);
        let before = buffer.load();
        buffer.publish(vec![3, 4, 5]);
        assert_eq!(*before, vec![1, 2]);
        assert_eq!(*buffer.load(), vec![3, 4, 5]);
        assert_eq!(buffer.generation(), 1);
    }

    #[test]
    fn concurrent_readers_never_observe_torn_values() {
        // 每一代的值都是长度为 n、元素全部为 n 的向量
        let buffer = Arc::new(DoubleBuffer::new(vec![0u64; 0]));
        let writer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for n in 1..=500u64 {
                    buffer.publish(vec![n; n as usize]);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let value = buffer.load();
                        let n = value.len() as u64;
                        assert!(value.iter().all(|v| *v == n), "torn read at generation {}", n);
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.load().len(), 500);
    }
}
