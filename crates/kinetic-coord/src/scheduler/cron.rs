//! Translation of a fixed set of cron expressions into timer delays.
//!
//! This is not a general cron engine. Supported forms:
//!
//! | Expression        | Meaning                         |
//! |-------------------|---------------------------------|
//! | `* * * * *`       | every minute                    |
//! | `*/N * * * *`     | every N minutes                 |
//! | `0 * * * *`       | hourly                          |
//! | `0 */N * * *`     | every N hours                   |
//! | `0 */N * * * *`   | every N hours (six-field form)  |
//! | `M H * * *`       | daily at H:M                    |
//! | `0 H * * W`       | weekly on weekday W at H:00     |
//!
//! Weekdays are 0-6 starting Sunday; 7 is also Sunday.

use std::fmt;
use std::time::Duration;

use kinetic_core::{CoordError, Result, codes};
use time::{OffsetDateTime, Time, Weekday};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronSchedule {
    EveryMinute,
    EveryMinutes(u32),
    Hourly,
    EveryHours(u32),
    DailyAt { hour: u8, minute: u8 },
    WeeklyAt { weekday: Weekday, hour: u8 },
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let unsupported =
            || CoordError::validation(codes::INVALID_CRON, format!("unsupported cron expression '{expression}'"));

        match fields.as_slice() {
            ["0", hours, "*", "*", "*", "*"] => step(hours).map(Self::EveryHours).ok_or_else(unsupported),
            ["*", "*", "*", "*", "*"] => Ok(Self::EveryMinute),
            [minutes, "*", "*", "*", "*"] if minutes.starts_with("*/") => {
                step(minutes).map(Self::EveryMinutes).ok_or_else(unsupported)
            }
            ["0", "*", "*", "*", "*"] => Ok(Self::Hourly),
            ["0", hours, "*", "*", "*"] if hours.starts_with("*/") => {
                step(hours).map(Self::EveryHours).ok_or_else(unsupported)
            }
            [minute, hour, "*", "*", "*"] => match (number(minute, 59), number(hour, 23)) {
                (Some(minute), Some(hour)) => Ok(Self::DailyAt { hour, minute }),
                _ => Err(unsupported()),
            },
            ["0", hour, "*", "*", weekday] => match (number(hour, 23), number(weekday, 7)) {
                (Some(hour), Some(day)) => Ok(Self::WeeklyAt {
                    weekday: weekday_from_cron(day),
                    hour,
                }),
                _ => Err(unsupported()),
            },
            _ => Err(unsupported()),
        }
    }

    /// Delay from `now` to the next occurrence.
    ///
    /// Interval forms return the plain interval. Daily and weekly forms
    /// return the time until the next wall-clock match in `now`'s offset,
    /// always greater than zero and at most one period.
    pub fn delay_from(&self, now: OffsetDateTime) -> Duration {
        match *self {
            Self::EveryMinute => MINUTE,
            Self::EveryMinutes(n) => MINUTE * n,
            Self::Hourly => HOUR,
            Self::EveryHours(n) => HOUR * n,
            Self::DailyAt { hour, minute } => {
                let mut next = at_time(now, hour, minute);
                if next <= now {
                    next += time::Duration::days(1);
                }
                to_std(next - now)
            }
            Self::WeeklyAt { weekday, hour } => {
                let days_ahead = (i64::from(weekday.number_days_from_sunday())
                    - i64::from(now.weekday().number_days_from_sunday()))
                .rem_euclid(7);
                let mut next = at_time(now, hour, 0) + time::Duration::days(days_ahead);
                if next <= now {
                    next += time::Duration::weeks(1);
                }
                to_std(next - now)
            }
        }
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EveryMinute => write!(f, "every minute"),
            Self::EveryMinutes(n) => write!(f, "every {n} minutes"),
            Self::Hourly => write!(f, "hourly"),
            Self::EveryHours(n) => write!(f, "every {n} hours"),
            Self::DailyAt { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            Self::WeeklyAt { weekday, hour } => write!(f, "weekly on {weekday} at {hour:02}:00"),
        }
    }
}

/// `*/N` with N >= 1.
fn step(field: &str) -> Option<u32> {
    field
        .strip_prefix("*/")
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|n| *n > 0)
}

fn number(field: &str, max: u8) -> Option<u8> {
    field.parse::<u8>().ok().filter(|n| *n <= max)
}

fn weekday_from_cron(day: u8) -> Weekday {
    match day % 7 {
        0 => Weekday::Sunday,
        1 => Weekday::Monday,
        2 => Weekday::Tuesday,
        3 => Weekday::Wednesday,
        4 => Weekday::Thursday,
        5 => Weekday::Friday,
        _ => Weekday::Saturday,
    }
}

fn at_time(now: OffsetDateTime, hour: u8, minute: u8) -> OffsetDateTime {
    now.replace_time(Time::from_hms(hour, minute, 0).unwrap_or(Time::MIDNIGHT))
}

fn to_std(delta: time::Duration) -> Duration {
    Duration::try_from(delta).unwrap_or(Duration::ZERO)
}
