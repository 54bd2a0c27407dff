//! Recurrence descriptors and their 5-field cron encoding.
//!
//! | unit   | cron (min hour day month weekday) |
//! |--------|-----------------------------------|
//! | minute | `*/i * * * *`                     |
//! | hour   | `m */i * * *`                     |
//! | day    | `m h */i * *`                     |
//! | week   | `m h * * (i mod 7)`               |
//! | month  | `m h d */i *` (d defaults to 1)   |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Recurrence unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Minute => write!(f, "minute"),
            Unit::Hour => write!(f, "hour"),
            Unit::Day => write!(f, "day"),
            Unit::Week => write!(f, "week"),
            Unit::Month => write!(f, "month"),
        }
    }
}

impl FromStr for Unit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minute" => Ok(Unit::Minute),
            "hour" => Ok(Unit::Hour),
            "day" => Ok(Unit::Day),
            "week" => Ok(Unit::Week),
            "month" => Ok(Unit::Month),
            _ => Err(Error::Validation(format!(
                "Unknown unit '{}', expected minute, hour, day, week or month",
                s
            ))),
        }
    }
}

/// Wall-clock time, serialized as "HH:MM".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::Validation(format!(
                "Invalid time {:02}:{:02}",
                hour, minute
            )));
        }
        Ok(Self { hour, minute })
    }
}

impl FromStr for TimeOfDay {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::Validation(format!("Invalid time '{}', expected HH:MM", s)))?;
        let hour = h
            .parse::<u32>()
            .map_err(|_| Error::Validation(format!("Invalid hour in '{}'", s)))?;
        let minute = m
            .parse::<u32>()
            .map_err(|_| Error::Validation(format!("Invalid minute in '{}'", s)))?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(time: TimeOfDay) -> Self {
        time.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Compact recurrence descriptor.
///
/// For `week` the interval is the weekday (0 = Sunday). Only canonical
/// descriptors are valid, so every valid descriptor survives
/// `from_cron(to_cron(d))`: `minute` carries `00:00`, `hour` carries only
/// the minute, and a month's default day 1 is left unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub interval: u32,
    pub unit: Unit,
    pub time: TimeOfDay,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
}

impl Descriptor {
    /// Build a canonical descriptor. Time components the unit does not
    /// encode are dropped and a week interval wraps to a weekday.
    pub fn new(interval: u32, unit: Unit, time: &str) -> Result<Self> {
        let mut time: TimeOfDay = time.parse()?;
        let mut interval = interval;
        match unit {
            Unit::Minute => time = TimeOfDay::default(),
            Unit::Hour => time.hour = 0,
            Unit::Week => interval %= 7,
            Unit::Day | Unit::Month => {}
        }

        let descriptor = Self {
            interval,
            unit,
            time,
            day_of_month: None,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Day 1 is the monthly default and stays unset.
    pub fn with_day_of_month(mut self, day: u32) -> Self {
        self.day_of_month = (self.unit != Unit::Month || day != 1).then_some(day);
        self
    }

    /// Check the interval range for the unit and that the descriptor is in
    /// canonical form.
    pub fn validate(&self) -> Result<()> {
        let (min, max) = match self.unit {
            Unit::Minute => (1, 59),
            Unit::Hour => (1, 23),
            Unit::Day => (1, 31),
            Unit::Week => (0, 6),
            Unit::Month => (1, 12),
        };
        if self.interval < min || self.interval > max {
            return Err(Error::Validation(format!(
                "Interval {} out of range {}..={} for unit '{}'",
                self.interval, min, max, self.unit
            )));
        }
        if let Some(day) = self.day_of_month {
            if self.unit != Unit::Month {
                return Err(Error::Validation(
                    "dayOfMonth is only valid for unit 'month'".to_string(),
                ));
            }
            if !(2..=31).contains(&day) {
                return Err(Error::Validation(format!(
                    "dayOfMonth {} out of range 2..=31 (1 is the default; leave it unset)",
                    day
                )));
            }
        }
        match self.unit {
            Unit::Minute if self.time != TimeOfDay::default() => Err(Error::Validation(
                "Unit 'minute' carries no time of day; use 00:00".to_string(),
            )),
            Unit::Hour if self.time.hour != 0 => Err(Error::Validation(format!(
                "Unit 'hour' carries only the minute; use 00:{:02}",
                self.time.minute
            ))),
            _ => Ok(()),
        }
    }
}

/// Encode a descriptor as a 5-field cron string.
pub fn to_cron(descriptor: &Descriptor) -> String {
    let Descriptor {
        interval,
        unit,
        time,
        day_of_month,
    } = descriptor;
    let (h, m) = (time.hour, time.minute);

    match unit {
        Unit::Minute => format!("*/{} * * * *", interval),
        Unit::Hour => format!("{} */{} * * *", m, interval),
        Unit::Day => format!("{} {} */{} * *", m, h, interval),
        Unit::Week => format!("{} {} * * {}", m, h, interval % 7),
        Unit::Month => format!("{} {} {} */{} *", m, h, day_of_month.unwrap_or(1), interval),
    }
}

/// Decode a cron string produced by [`to_cron`] (or an equivalent one).
///
/// Precedence: weekday-constrained, then month/day-constrained, then
/// hour-stepped, then minute-stepped. Constraining both day-of-month and
/// weekday is ambiguous and rejected.
pub fn from_cron(expr: &str) -> Result<Descriptor> {
    let fields = split_fields(expr)?;
    let [minute, hour, day, month, weekday] = fields;

    if is_constrained(day) && is_constrained(weekday) {
        return Err(Error::Validation(format!(
            "Cron '{}' constrains both day-of-month and weekday",
            expr
        )));
    }

    if is_constrained(weekday) {
        let interval = parse_number(weekday, "weekday", 0, 7)? % 7;
        return Ok(Descriptor {
            interval,
            unit: Unit::Week,
            time: clock_time(hour, minute)?,
            day_of_month: None,
        });
    }

    if let Some(step) = parse_step(month)? {
        let day = parse_number(day, "day-of-month", 1, 31)?;
        return Ok(Descriptor {
            interval: step,
            unit: Unit::Month,
            time: clock_time(hour, minute)?,
            day_of_month: (day != 1).then_some(day),
        }
        .checked()?);
    }

    if is_constrained(month) {
        return Err(Error::Validation(format!(
            "Cron '{}' constrains the month field without a step",
            expr
        )));
    }

    if is_constrained(day) {
        let interval = match parse_step(day)? {
            Some(step) => step,
            None => parse_number(day, "day-of-month", 1, 31)?,
        };
        return Descriptor {
            interval,
            unit: Unit::Day,
            time: clock_time(hour, minute)?,
            day_of_month: None,
        }
        .checked();
    }

    if let Some(step) = parse_step(hour)? {
        return Descriptor {
            interval: step,
            unit: Unit::Hour,
            time: TimeOfDay::new(0, parse_number(minute, "minute", 0, 59)?)?,
            day_of_month: None,
        }
        .checked();
    }

    if let Some(step) = parse_step(minute)? {
        if is_constrained(hour) {
            return Err(Error::Validation(format!(
                "Cron '{}' mixes a minute step with a fixed hour",
                expr
            )));
        }
        return Descriptor {
            interval: step,
            unit: Unit::Minute,
            time: TimeOfDay::default(),
            day_of_month: None,
        }
        .checked();
    }

    Err(Error::Validation(format!(
        "Cron '{}' does not match any recurrence unit",
        expr
    )))
}

/// Validate an arbitrary 5-field expression for use in a schedule.
///
/// Accepts anything the cron engine can parse, except expressions that
/// constrain both day-of-month and weekday.
pub fn validate_expression(expr: &str) -> Result<()> {
    let [_, _, day, _, weekday] = split_fields(expr)?;
    if is_constrained(day) && is_constrained(weekday) {
        return Err(Error::Validation(format!(
            "Cron '{}' constrains both day-of-month and weekday",
            expr
        )));
    }
    croner::Cron::new(expr)
        .parse()
        .map_err(|e| Error::Validation(format!("Invalid cron '{}': {}", expr, e)))?;
    Ok(())
}

impl Descriptor {
    fn checked(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}

fn split_fields(expr: &str) -> Result<[&str; 5]> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    parts.try_into().map_err(|parts: Vec<&str>| {
        Error::Validation(format!(
            "Cron '{}' must have 5 fields, found {}",
            expr,
            parts.len()
        ))
    })
}

fn is_constrained(field: &str) -> bool {
    field != "*" && field != "?"
}

/// `*/n` -> Some(n); `*` -> None; anything else is not a step.
fn parse_step(field: &str) -> Result<Option<u32>> {
    match field.strip_prefix("*/") {
        Some(n) => n
            .parse::<u32>()
            .map(Some)
            .map_err(|_| Error::Validation(format!("Invalid step '{}'", field))),
        None => Ok(None),
    }
}

fn parse_number(field: &str, name: &str, min: u32, max: u32) -> Result<u32> {
    let value = field
        .parse::<u32>()
        .map_err(|_| Error::Validation(format!("Invalid {} '{}'", name, field)))?;
    if value < min || value > max {
        return Err(Error::Validation(format!(
            "{} {} out of range {}..={}",
            name, value, min, max
        )));
    }
    Ok(value)
}

fn clock_time(hour: &str, minute: &str) -> Result<TimeOfDay> {
    TimeOfDay::new(
        parse_number(hour, "hour", 0, 23)?,
        parse_number(minute, "minute", 0, 59)?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_scenario() {
        let d = Descriptor::new(2, Unit::Day, "08:30").unwrap();
        assert_eq!(to_cron(&d), "30 8 */2 * *");
        assert_eq!(from_cron("30 8 */2 * *").unwrap(), d);
    }

    #[test]
    fn test_encodings() {
        let cases = [
            (Descriptor::new(15, Unit::Minute, "00:00").unwrap(), "*/15 * * * *"),
            (Descriptor::new(3, Unit::Hour, "00:45").unwrap(), "45 */3 * * *"),
            (Descriptor::new(1, Unit::Week, "09:05").unwrap(), "5 9 * * 1"),
            (Descriptor::new(2, Unit::Month, "18:00").unwrap(), "0 18 1 */2 *"),
            (
                Descriptor::new(1, Unit::Month, "07:15").unwrap().with_day_of_month(10),
                "15 7 10 */1 *",
            ),
        ];
        for (descriptor, cron) in cases {
            assert_eq!(to_cron(&descriptor), cron);
            assert_eq!(from_cron(cron).unwrap(), descriptor, "decoding {}", cron);
        }
    }

    #[test]
    fn test_week_interval_wraps() {
        let d = Descriptor::new(7, Unit::Week, "10:00").unwrap();
        assert_eq!(d.interval, 0);
        assert_eq!(to_cron(&d), "0 10 * * 0");
        assert_eq!(from_cron(&to_cron(&d)).unwrap(), d);
    }

    #[test]
    fn test_constructors_drop_what_cron_cannot_carry() {
        let hourly = Descriptor::new(3, Unit::Hour, "08:30").unwrap();
        assert_eq!(hourly.time, TimeOfDay::new(0, 30).unwrap());
        assert_eq!(from_cron(&to_cron(&hourly)).unwrap(), hourly);

        let minutely = Descriptor::new(5, Unit::Minute, "12:15").unwrap();
        assert_eq!(minutely.time, TimeOfDay::default());
        assert_eq!(from_cron(&to_cron(&minutely)).unwrap(), minutely);

        let monthly = Descriptor::new(1, Unit::Month, "07:00")
            .unwrap()
            .with_day_of_month(1);
        assert_eq!(monthly.day_of_month, None);
        assert_eq!(from_cron(&to_cron(&monthly)).unwrap(), monthly);
    }

    #[test]
    fn test_validate_rejects_non_canonical() {
        let hand_built = |interval, unit, hour, minute, day_of_month| Descriptor {
            interval,
            unit,
            time: TimeOfDay::new(hour, minute).unwrap(),
            day_of_month,
        };
        assert!(hand_built(3, Unit::Hour, 8, 30, None).validate().is_err());
        assert!(hand_built(5, Unit::Minute, 0, 15, None).validate().is_err());
        assert!(hand_built(7, Unit::Week, 10, 0, None).validate().is_err());
        assert!(hand_built(1, Unit::Month, 7, 0, Some(1)).validate().is_err());
        assert!(hand_built(2, Unit::Day, 7, 0, Some(3)).validate().is_err());

        assert!(hand_built(3, Unit::Hour, 0, 30, None).validate().is_ok());
        assert!(hand_built(6, Unit::Week, 10, 0, None).validate().is_ok());
        assert!(hand_built(1, Unit::Month, 7, 0, Some(15)).validate().is_ok());
    }

    #[test]
    fn test_round_trip_over_units() {
        let times = ["00:00", "08:30", "23:59"];
        for unit in [Unit::Minute, Unit::Hour, Unit::Day, Unit::Week, Unit::Month] {
            for interval in [1, 2, 5] {
                for time in times {
                    let d = Descriptor::new(interval, unit, time).unwrap();
                    let decoded = from_cron(&to_cron(&d)).unwrap();
                    assert_eq!(decoded, d, "unit {} interval {} time {}", unit, interval, time);
                }
            }
        }
    }

    #[test]
    fn test_rejects_day_and_weekday() {
        let err = from_cron("* 1 1 * 2").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(validate_expression("0 9 15 * 1").is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(from_cron("*/5 * * *").is_err());
        assert!(from_cron("* * * * *").is_err());
        assert!(from_cron("0 25 */2 * *").is_err());
        assert!(from_cron("*/x * * * *").is_err());
        assert!(Descriptor::new(0, Unit::Day, "08:00").is_err());
        assert!(Descriptor::new(1, Unit::Day, "8h").is_err());
    }

    #[test]
    fn test_validate_expression_accepts_advanced_cron() {
        assert!(validate_expression("0 9 * * 1-5").is_ok());
        assert!(validate_expression("not a cron").is_err());
    }

    #[test]
    fn test_descriptor_json_shape() {
        let d = Descriptor::new(1, Unit::Month, "07:15").unwrap().with_day_of_month(10);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"interval": 1, "unit": "month", "time": "07:15", "dayOfMonth": 10})
        );
        let back: Descriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }
}
