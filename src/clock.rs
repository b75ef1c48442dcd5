//! 可注入的时钟：缓存、上传会话与签名链接共用。

use std::fmt::Debug;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 墙上时钟抽象，测试中可替换为手动推进的实现。
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// 将时间点转换为 Unix 秒。早于纪元的时间返回 0。
pub fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

/// `later - earlier`，时钟回拨时返回零。
pub fn elapsed_between(earlier: SystemTime, later: SystemTime) -> Duration {
    later.duration_since(earlier).unwrap_or(Duration::ZERO)
}
