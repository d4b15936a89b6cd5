//! 可注入时钟
//!
//! 过期判断与相对日期解析都依赖“当前时间”。协调器持有一个 `Arc<dyn Clock>`，
//! 测试中替换为可手动推进的时钟即可覆盖 TTL 边界。

use chrono::{DateTime, Utc};

/// 时间来源
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Unix 秒转为 UTC 时间，超出范围时回落到纪元
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// 手动推进的测试时钟
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn at(secs: i64) -> Self {
            Self {
                now: Mutex::new(from_unix(secs)),
            }
        }

        pub fn set(&self, secs: i64) {
            *self.now.lock().unwrap() = from_unix(secs);
        }

        pub fn advance(&self, secs: i64) {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}
