//! 事件统计
//!
//! 对一组同名事件计算计数、耗时以及各数值属性的 avg/total/min/max，
//! 结果本身也是一个事件，可以继续记录。

use chrono::Utc;
use dtf_common::{AttrValue, Event};
use std::collections::BTreeMap;
use tracing::warn;

use crate::recorder::Cursor;
use crate::ExecutorError;

/// 统计结果
#[derive(Debug)]
pub struct StatsReport {
    /// 合成的统计事件
    pub event: Event,

    /// 因类型冲突被跳过的属性
    pub skipped: Vec<ExecutorError>,
}

/// 全部为整数的属性另走精确的 i64 累加，溢出时退回浮点总和
#[derive(Default)]
struct Accumulator {
    count: usize,
    total: f64,
    min: f64,
    max: f64,
    ints: Option<IntTotals>,
    all_int: bool,
}

struct IntTotals {
    /// 溢出后为 None
    total: Option<i64>,
    min: i64,
    max: i64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            all_int: true,
            ..Default::default()
        }
    }

    fn push(&mut self, value: &AttrValue) {
        let Some(v) = value.as_f64() else { return };
        self.count += 1;
        self.total += v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);

        match value {
            AttrValue::Int(i) if self.all_int => {
                let i = *i;
                self.ints = Some(match self.ints.take() {
                    Some(acc) => IntTotals {
                        total: acc.total.and_then(|t| t.checked_add(i)),
                        min: acc.min.min(i),
                        max: acc.max.max(i),
                    },
                    None => IntTotals {
                        total: Some(i),
                        min: i,
                        max: i,
                    },
                });
            }
            AttrValue::Int(_) => {}
            _ => {
                self.all_int = false;
                self.ints = None;
            }
        }
    }

    fn write(&self, prefix: &str, out: &mut Event) {
        if self.count == 0 {
            return;
        }
        let avg = self.total / self.count as f64;
        let (total, min, max) = match &self.ints {
            Some(ints) if self.all_int => (
                ints.total
                    .map(AttrValue::Int)
                    .unwrap_or(AttrValue::Float(self.total)),
                AttrValue::Int(ints.min),
                AttrValue::Int(ints.max),
            ),
            _ => (
                AttrValue::Float(self.total),
                AttrValue::Float(self.min),
                AttrValue::Float(self.max),
            ),
        };
        out.attributes
            .insert(format!("{}.avg", prefix), AttrValue::Float(avg));
        out.attributes.insert(format!("{}.total", prefix), total);
        out.attributes.insert(format!("{}.min", prefix), min);
        out.attributes.insert(format!("{}.max", prefix), max);
    }
}

/// 计算统计事件
///
/// 缺失的属性值不参与计算；同一属性既有数值又有非数值时跳过该属性。
/// 纯文本/布尔属性直接忽略。
pub fn calc_stats(cursor: &Cursor, name: &str) -> StatsReport {
    let mut event = Event::new(name).with_attr("count", cursor.len() as i64);
    let mut skipped = Vec::new();

    if cursor.is_empty() {
        return StatsReport { event, skipped };
    }

    // 耗时
    let mut duration = Accumulator::new();
    for e in cursor.iter() {
        if let Some(ms) = e.duration_ms {
            duration.push(&AttrValue::Int(ms as i64));
        }
    }
    duration.write("duration", &mut event);

    // 首个开始到最后结束的跨度
    let first = cursor.iter().map(|e| e.timestamp).min();
    let last = cursor.iter().map(|e| e.end_time()).max();
    if let (Some(first), Some(last)) = (first, last) {
        event = event
            .at(first)
            .with_attr("span_ms", (last - first).num_milliseconds());
    } else {
        event = event.at(Utc::now());
    }

    // 按属性分组
    let mut fields: BTreeMap<&str, Vec<&AttrValue>> = BTreeMap::new();
    for e in cursor.iter() {
        for (key, value) in &e.attributes {
            fields.entry(key.as_str()).or_default().push(value);
        }
    }

    for (field, values) in fields {
        let numeric = values.iter().filter(|v| v.is_numeric()).count();
        if numeric == 0 {
            continue;
        }
        if numeric != values.len() {
            let error = ExecutorError::Aggregation(format!(
                "属性 {} 的取值类型不一致 ({} 个数值, {} 个非数值)，已跳过",
                field,
                numeric,
                values.len() - numeric
            ));
            warn!("{}", error);
            skipped.push(error);
            continue;
        }

        let mut acc = Accumulator::new();
        for value in values {
            acc.push(value);
        }
        acc.write(field, &mut event);
    }

    StatsReport { event, skipped }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(size: AttrValue, duration: u64) -> Event {
        Event::new("put").with_duration(duration).with_attr("size", size)
    }

    #[test]
    fn test_numeric_field_stats() {
        let cursor = Cursor::from_events(
            [1, 2, 3, 4]
                .into_iter()
                .map(|s| sized(AttrValue::Int(s), 10))
                .collect(),
        );

        let report = calc_stats(&cursor, "put.stats");
        let e = &report.event;
        assert_eq!(e.attr("count"), Some(&AttrValue::Int(4)));
        assert_eq!(e.attr("size.avg"), Some(&AttrValue::Float(2.5)));
        assert_eq!(e.attr("size.total"), Some(&AttrValue::Int(10)));
        assert_eq!(e.attr("size.min"), Some(&AttrValue::Int(1)));
        assert_eq!(e.attr("size.max"), Some(&AttrValue::Int(4)));
        assert_eq!(e.attr("duration.total"), Some(&AttrValue::Int(40)));
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn test_missing_values_do_not_contribute() {
        let cursor = Cursor::from_events(vec![
            sized(AttrValue::Float(1.0), 1),
            Event::new("put").with_duration(1),
            sized(AttrValue::Float(3.0), 1),
        ]);

        let e = calc_stats(&cursor, "s").event;
        assert_eq!(e.attr("count"), Some(&AttrValue::Int(3)));
        assert_eq!(e.attr("size.avg"), Some(&AttrValue::Float(2.0)));
        assert_eq!(e.attr("size.total"), Some(&AttrValue::Float(4.0)));
    }

    #[test]
    fn test_type_conflict_skips_field() {
        let cursor = Cursor::from_events(vec![
            sized(AttrValue::Int(1), 1).with_attr("latency", 5i64),
            sized(AttrValue::Text("big".to_string()), 1).with_attr("latency", 7i64),
        ]);

        let report = calc_stats(&cursor, "s");
        assert!(report.event.attr("size.avg").is_none());
        assert_eq!(report.event.attr("latency.max"), Some(&AttrValue::Int(7)));
        assert_eq!(report.skipped.len(), 1);
        assert!(matches!(report.skipped[0], ExecutorError::Aggregation(_)));
    }

    #[test]
    fn test_text_fields_ignored_and_span() {
        let base = Utc::now();
        let cursor = Cursor::from_events(vec![
            Event::new("op").at(base).with_duration(100).with_attr("oid", "a"),
            Event::new("op")
                .at(base + chrono::Duration::milliseconds(50))
                .with_duration(100)
                .with_attr("oid", "b"),
        ]);

        let report = calc_stats(&cursor, "s");
        assert!(report.skipped.is_empty());
        assert!(report.event.attr("oid.avg").is_none());
        assert_eq!(report.event.attr("span_ms"), Some(&AttrValue::Int(150)));
        assert_eq!(report.event.timestamp, base);
    }

    #[test]
    fn test_large_integers_stay_exact() {
        let big = (1i64 << 53) + 1;
        let cursor = Cursor::from_events(vec![
            sized(AttrValue::Int(big), 1),
            sized(AttrValue::Int(2), 1),
        ]);

        let e = calc_stats(&cursor, "bytes").event;
        assert_eq!(e.attr("size.total"), Some(&AttrValue::Int(big + 2)));
        assert_eq!(e.attr("size.max"), Some(&AttrValue::Int(big)));
        assert_eq!(e.attr("size.min"), Some(&AttrValue::Int(2)));
    }

    #[test]
    fn test_integer_overflow_falls_back_to_float_total() {
        let cursor = Cursor::from_events(vec![
            sized(AttrValue::Int(i64::MAX), 1),
            sized(AttrValue::Int(i64::MAX), 1),
        ]);

        let e = calc_stats(&cursor, "s").event;
        assert!(matches!(e.attr("size.total"), Some(AttrValue::Float(_))));
        assert_eq!(e.attr("size.max"), Some(&AttrValue::Int(i64::MAX)));
    }

    #[test]
    fn test_empty_cursor() {
        let e = calc_stats(&Cursor::default(), "none").event;
        assert_eq!(e.attr("count"), Some(&AttrValue::Int(0)));
        assert_eq!(e.attributes.len(), 1);
    }
}
