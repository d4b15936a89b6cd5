//! 日期过滤值
//!
//! 相对日期（“7 days ago”）在翻译时按当前时钟解析，而不是在写入时固化。
//! 每个日期值解析为半开区间 `[start, end)`（Unix 秒）：按天的模式覆盖整天，
//! 精确时间覆盖一秒。

use crate::data::{CacheError, Result};
use chrono::{DateTime, Days, Months, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

const SECONDS_PER_DAY: i64 = 86_400;

static RELATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+|one|a|an)\s+(day|week|month)s?\s+(ago|from now)$").unwrap()
});

/// 日期模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateMode {
    Today,
    Tomorrow,
    Yesterday,
    DaysAgo(u32),
    DaysFromNow(u32),
    WeeksAgo(u32),
    WeeksFromNow(u32),
    MonthsAgo(u32),
    MonthsFromNow(u32),
    ExactDate(NaiveDate),
    ExactTime(DateTime<Utc>),
}

/// 解析后的时间窗口 `[start, end)`，Unix 秒
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: i64,
    pub end: i64,
}

impl DateMode {
    /// 以 `now` 为基准解析为时间窗口
    pub fn resolve(&self, now: DateTime<Utc>) -> DateWindow {
        let today = now.date_naive();
        let day = match *self {
            DateMode::ExactTime(t) => {
                return DateWindow {
                    start: t.timestamp(),
                    end: t.timestamp() + 1,
                }
            }
            DateMode::ExactDate(d) => d,
            DateMode::Today => today,
            DateMode::Tomorrow => shift_days(today, 1),
            DateMode::Yesterday => shift_days(today, -1),
            DateMode::DaysAgo(n) => shift_days(today, -i64::from(n)),
            DateMode::DaysFromNow(n) => shift_days(today, i64::from(n)),
            DateMode::WeeksAgo(n) => shift_days(today, -7 * i64::from(n)),
            DateMode::WeeksFromNow(n) => shift_days(today, 7 * i64::from(n)),
            DateMode::MonthsAgo(n) => today.checked_sub_months(Months::new(n)).unwrap_or(today),
            DateMode::MonthsFromNow(n) => {
                today.checked_add_months(Months::new(n)).unwrap_or(today)
            }
        };
        let start = day.and_time(NaiveTime::MIN).and_utc().timestamp();
        DateWindow {
            start,
            end: start + SECONDS_PER_DAY,
        }
    }
}

fn shift_days(day: NaiveDate, delta: i64) -> NaiveDate {
    let shifted = if delta >= 0 {
        day.checked_add_days(Days::new(delta.unsigned_abs()))
    } else {
        day.checked_sub_days(Days::new(delta.unsigned_abs()))
    };
    shifted.unwrap_or(day)
}

impl FromStr for DateMode {
    type Err = CacheError;

    fn from_str(input: &str) -> Result<Self> {
        let phrase = input.trim().to_ascii_lowercase();
        let phrase = phrase.split_whitespace().collect::<Vec<_>>().join(" ");

        match phrase.as_str() {
            "today" | "now" => return Ok(DateMode::Today),
            "tomorrow" => return Ok(DateMode::Tomorrow),
            "yesterday" => return Ok(DateMode::Yesterday),
            _ => {}
        }

        if let Some(caps) = RELATIVE_RE.captures(&phrase) {
            let n: u32 = match &caps[1] {
                "one" | "a" | "an" => 1,
                digits => digits
                    .parse()
                    .map_err(|_| CacheError::InvalidFilter(format!("日期数量超出范围: {input}")))?,
            };
            let ago = &caps[3] == "ago";
            return Ok(match (&caps[2], ago) {
                ("day", true) => DateMode::DaysAgo(n),
                ("day", false) => DateMode::DaysFromNow(n),
                ("week", true) => DateMode::WeeksAgo(n),
                ("week", false) => DateMode::WeeksFromNow(n),
                ("month", true) => DateMode::MonthsAgo(n),
                _ => DateMode::MonthsFromNow(n),
            });
        }

        let raw = input.trim();
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Ok(DateMode::ExactDate(date));
        }
        if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
            return Ok(DateMode::ExactTime(time.with_timezone(&Utc)));
        }
        if let Ok(time) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
            return Ok(DateMode::ExactTime(time.and_utc()));
        }

        Err(CacheError::InvalidFilter(format!("无法解析的日期: {input}")))
    }
}

impl fmt::Display for DateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateMode::Today => f.write_str("today"),
            DateMode::Tomorrow => f.write_str("tomorrow"),
            DateMode::Yesterday => f.write_str("yesterday"),
            DateMode::DaysAgo(n) => write!(f, "{n} days ago"),
            DateMode::DaysFromNow(n) => write!(f, "{n} days from now"),
            DateMode::WeeksAgo(n) => write!(f, "{n} weeks ago"),
            DateMode::WeeksFromNow(n) => write!(f, "{n} weeks from now"),
            DateMode::MonthsAgo(n) => write!(f, "{n} months ago"),
            DateMode::MonthsFromNow(n) => write!(f, "{n} months from now"),
            DateMode::ExactDate(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            DateMode::ExactTime(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}
