//! Calendar conversions for [`Value::Date`](crate::Value::Date),
//! [`Value::Time`](crate::Value::Time) and
//! [`Value::Timestamp`](crate::Value::Timestamp).
//!
//! Dates are days since 1970-01-01 in the proleptic Gregorian calendar.

pub const MICROS_PER_SECOND: i64 = 1_000_000;
pub const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

/// Convert days since the Unix epoch to (year, month, day).
#[allow(clippy::cast_possible_truncation)]
pub fn days_to_ymd(days: i32) -> (i32, u32, u32) {
    // Shift to an era starting 0000-03-01 so leap days fall at year end.
    let z = i64::from(days) + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y as i32, m as u32, d as u32)
}

/// Convert (year, month, day) to days since the Unix epoch.
#[allow(clippy::cast_possible_truncation)]
pub fn ymd_to_days(year: i32, month: u32, day: u32) -> i32 {
    let y = i64::from(year) - i64::from(month <= 2);
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let m = i64::from(month);
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    (era * 146_097 + doe - 719_468) as i32
}

/// Split microseconds since the epoch into a day number and microseconds of day.
#[allow(clippy::cast_possible_truncation)]
pub fn split_timestamp(micros: i64) -> (i32, i64) {
    let days = micros.div_euclid(MICROS_PER_DAY);
    (days as i32, micros.rem_euclid(MICROS_PER_DAY))
}

/// `YYYY-MM-DD`
pub fn format_date(days: i32) -> String {
    let (y, m, d) = days_to_ymd(days);
    format!("{y:04}-{m:02}-{d:02}")
}

/// `[-]HH:MM:SS[.ffffff]`; hours may exceed 24 for durations.
pub fn format_time(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    let frac = abs % 1_000_000;
    let secs = abs / 1_000_000;
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if frac == 0 {
        format!("{sign}{h:02}:{m:02}:{s:02}")
    } else {
        format!("{sign}{h:02}:{m:02}:{s:02}.{frac:06}")
    }
}

/// `YYYY-MM-DD HH:MM:SS[.ffffff]`
pub fn format_timestamp(micros: i64) -> String {
    let (days, of_day) = split_timestamp(micros);
    format!("{} {}", format_date(days), format_time(of_day))
}

/// Parse `YYYY-MM-DD`. Zero dates (`0000-00-00`) return `None`.
pub fn parse_date(s: &str) -> Option<i32> {
    let mut parts = s.splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(ymd_to_days(year, month, day))
}

/// Parse `[-]H+:MM:SS[.f+]` into microseconds.
pub fn parse_time(s: &str) -> Option<i64> {
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (clock, frac) = match body.split_once('.') {
        Some((clock, frac)) => (clock, Some(frac)),
        None => (body, None),
    };
    let mut parts = clock.splitn(3, ':');
    let h: i64 = parts.next()?.parse().ok()?;
    let m: i64 = parts.next()?.parse().ok()?;
    let sec: i64 = parts.next()?.parse().ok()?;
    let micros = match frac {
        Some(f) if !f.is_empty() && f.len() <= 6 && f.bytes().all(|b| b.is_ascii_digit()) => {
            let padded = format!("{f:0<6}");
            padded.parse::<i64>().ok()?
        }
        Some(_) => return None,
        None => 0,
    };
    let total = ((h * 3600 + m * 60 + sec) * MICROS_PER_SECOND) + micros;
    Some(if negative { -total } else { total })
}

/// Parse `YYYY-MM-DD[ HH:MM:SS[.f+]]` into microseconds since the epoch.
pub fn parse_timestamp(s: &str) -> Option<i64> {
    let (date, time) = match s.split_once([' ', 'T']) {
        Some((date, time)) => (date, Some(time)),
        None => (s, None),
    };
    let days = parse_date(date)?;
    let of_day = match time {
        Some(t) => parse_time(t)?,
        None => 0,
    };
    Some(i64::from(days) * MICROS_PER_DAY + of_day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_and_leap_days() {
        assert_eq!(days_to_ymd(0), (1970, 1, 1));
        assert_eq!(ymd_to_days(1970, 1, 1), 0);
        assert_eq!(days_to_ymd(ymd_to_days(2024, 2, 29)), (2024, 2, 29));
        assert_eq!(days_to_ymd(-1), (1969, 12, 31));
        assert_eq!(ymd_to_days(2000, 3, 1) - ymd_to_days(2000, 2, 28), 2);
    }

    #[test]
    fn formats_and_parses_timestamps() {
        let ts = parse_timestamp("2023-06-15 13:45:30.25").unwrap();
        assert_eq!(format_timestamp(ts), "2023-06-15 13:45:30.250000");
        assert_eq!(parse_timestamp("2023-06-15").unwrap() % MICROS_PER_DAY, 0);
        assert!(parse_date("0000-00-00").is_none());
    }

    #[test]
    fn negative_durations() {
        let t = parse_time("-838:59:59").unwrap();
        assert!(t < 0);
        assert_eq!(format_time(t), "-838:59:59");
        assert_eq!(format_time(1_500_000), "00:00:01.500000");
    }
}
