//! Recurrence rules and next-occurrence computation.
//!
//! Calendar rules (`@hourly`, `@daily`, `@weekly`, cron) are evaluated on the
//! local wall clock of the configured timezone, so a daily task keeps firing
//! at the same local time across DST transitions. `@every` intervals are
//! absolute and ignore the timezone.

use super::duration::parse_duration;
use super::error::SchedulerError;
use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveTime, TimeZone,
    Timelike, Utc, Weekday,
};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted `@every` interval.
const MAX_INTERVAL: Duration = Duration::from_secs(36_500 * 86_400);

/// Upper bound on cron candidates examined per lookup. Enough to walk a
/// repeated hour at one-second resolution.
const CRON_SCAN_LIMIT: usize = 7_200;

/// A parsed recurrence rule.
#[derive(Debug, Clone)]
pub enum Recurrence {
    /// Fixed interval from the previous occurrence.
    Every(Duration),
    /// Every hour at minute 0, local time.
    Hourly,
    /// Every day at the given local time.
    Daily(NaiveTime),
    /// Once a week at the given local weekday and time.
    Weekly(Weekday, NaiveTime),
    /// Cron expression with a seconds field.
    Cron(Box<Schedule>),
}

impl Recurrence {
    pub fn parse(rule: &str) -> Result<Self, SchedulerError> {
        let rule = rule.trim();
        let mut parts = rule.split_whitespace();
        let keyword = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match keyword {
            "@every" => {
                let [dur] = args.as_slice() else {
                    return Err(SchedulerError::invalid_rule(rule, "expected '@every <duration>'"));
                };
                let interval =
                    parse_duration(dur).map_err(|e| SchedulerError::invalid_rule(rule, e))?;
                if interval < Duration::from_secs(1) {
                    return Err(SchedulerError::invalid_rule(
                        rule,
                        "interval must be at least one second",
                    ));
                }
                if interval > MAX_INTERVAL {
                    return Err(SchedulerError::invalid_rule(
                        rule,
                        "interval must be at most 36500d",
                    ));
                }
                Ok(Recurrence::Every(interval))
            }
            "@hourly" => {
                if !args.is_empty() {
                    return Err(SchedulerError::invalid_rule(rule, "@hourly takes no arguments"));
                }
                Ok(Recurrence::Hourly)
            }
            "@daily" => match args.as_slice() {
                [] => Ok(Recurrence::Daily(NaiveTime::default())),
                [time] => Ok(Recurrence::Daily(parse_time(rule, time)?)),
                _ => Err(SchedulerError::invalid_rule(rule, "expected '@daily [HH:MM]'")),
            },
            "@weekly" => match args.as_slice() {
                [] => Ok(Recurrence::Weekly(Weekday::Sun, NaiveTime::default())),
                [day, time] => {
                    let weekday = day.parse::<Weekday>().map_err(|_| {
                        SchedulerError::invalid_rule(rule, format!("unknown weekday '{}'", day))
                    })?;
                    Ok(Recurrence::Weekly(weekday, parse_time(rule, time)?))
                }
                _ => Err(SchedulerError::invalid_rule(
                    rule,
                    "expected '@weekly [<day> HH:MM]'",
                )),
            },
            "" => Err(SchedulerError::invalid_rule(rule, "empty rule")),
            k if k.starts_with('@') => Err(SchedulerError::invalid_rule(
                rule,
                format!("unknown keyword '{}'", k),
            )),
            _ => {
                // The cron crate wants a seconds field; accept classic 5-field
                // expressions too.
                let expr = if rule.split_whitespace().count() == 5 {
                    format!("0 {}", rule)
                } else {
                    rule.to_string()
                };
                let schedule = Schedule::from_str(&expr)
                    .map_err(|e| SchedulerError::invalid_rule(rule, e.to_string()))?;
                Ok(Recurrence::Cron(Box::new(schedule)))
            }
        }
    }

    /// Next scheduled instant after `last_run`.
    ///
    /// A task that never ran is due at `now`. `None` means the rule has no
    /// further occurrences.
    pub fn next_run(
        &self,
        tz: Tz,
        last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let Some(last) = last_run else {
            return Some(now);
        };

        match self {
            Recurrence::Every(interval) => {
                to_chrono(*interval).and_then(|step| last.checked_add_signed(step))
            }
            Recurrence::Hourly => next_top_of_hour(tz, last),
            Recurrence::Daily(time) => {
                let start = last.with_timezone(&tz).date_naive();
                (0..=2)
                    .filter_map(|offset| start.checked_add_days(chrono::Days::new(offset)))
                    .map(|date| resolve_local(tz, date, *time))
                    .find(|candidate| *candidate > last)
            }
            Recurrence::Weekly(weekday, time) => {
                let start = last.with_timezone(&tz).date_naive();
                (0..=8)
                    .filter_map(|offset| start.checked_add_days(chrono::Days::new(offset)))
                    .filter(|date| date.weekday() == *weekday)
                    .map(|date| resolve_local(tz, date, *time))
                    .find(|candidate| *candidate > last)
            }
            Recurrence::Cron(schedule) => {
                // Walk the local wall clock, carried in a UTC value, so slots
                // inside a DST gap still map to an instant after the gap.
                let wall = Utc.from_utc_datetime(&last.with_timezone(&tz).naive_local());
                schedule
                    .after(&wall)
                    .take(CRON_SCAN_LIMIT)
                    .map(|slot| {
                        let slot = slot.naive_utc();
                        resolve_local(tz, slot.date(), slot.time())
                    })
                    .find(|candidate| *candidate > last)
            }
        }
    }

    /// First occurrence strictly after `now` on the grid defined by `anchor`.
    ///
    /// Used when a stale occurrence is skipped: intervals stay aligned to
    /// their original phase, calendar rules land on their next slot.
    pub fn next_after_now(
        &self,
        tz: Tz,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::Every(interval) => {
                if anchor > now {
                    return Some(anchor);
                }
                let step = to_chrono(*interval)?.num_milliseconds().max(1);
                let elapsed = (now - anchor).num_milliseconds();
                let offset = (elapsed / step + 1).checked_mul(step)?;
                anchor.checked_add_signed(ChronoDuration::try_milliseconds(offset)?)
            }
            _ => self.next_run(tz, Some(now.max(anchor)), now),
        }
    }
}

fn parse_time(rule: &str, value: &str) -> Result<NaiveTime, SchedulerError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|_| SchedulerError::invalid_rule(rule, format!("invalid time '{}'", value)))
}

fn to_chrono(d: Duration) -> Option<ChronoDuration> {
    ChronoDuration::from_std(d).ok()
}

/// Maps a local wall-clock time to an instant.
///
/// Ambiguous times (clocks going back) resolve to the earlier instant. Times
/// inside a gap (clocks going forward) resolve to the first valid local
/// minute after the gap.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let base = naive
                .with_second(0)
                .and_then(|n| n.with_nanosecond(0))
                .unwrap_or(naive);
            // Gaps are at most a few hours in practice.
            for minutes in 1..=(4 * 60) {
                let Some(shifted) = base.checked_add_signed(ChronoDuration::minutes(minutes))
                else {
                    break;
                };
                if let Some(dt) = tz.from_local_datetime(&shifted).earliest() {
                    return dt.with_timezone(&Utc);
                }
            }
            // Fall back to reading the wall time as UTC.
            Utc.from_utc_datetime(&naive)
        }
    }
}

/// Next instant after `last` whose local minute is zero.
fn next_top_of_hour(tz: Tz, last: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let base = last
        .with_second(0)
        .and_then(|dt| dt.with_nanosecond(0))
        .unwrap_or(last);
    (1..=120)
        .filter_map(|minutes| base.checked_add_signed(ChronoDuration::minutes(minutes)))
        .find(|candidate| *candidate > last && candidate.with_timezone(&tz).minute() == 0)
}
