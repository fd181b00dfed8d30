//! The DMTF `datetime` value type.
//!
//! A CIM datetime is either an absolute timestamp with a UTC offset or a
//! duration interval. Both share a single canonical string form of exactly
//! 25 ASCII characters; which of the two a string denotes is decided by the
//! character at offset 21 (`+`/`-` for timestamps, `:` for intervals).

use std::fmt;

/// An absolute point in time: `yyyymmddhhmmss.mmmmmmsutc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CimTimestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: u32,
    /// Offset from UTC in minutes, signed.
    pub utc_offset_min: i16,
}

/// A duration: `ddddddddhhmmss.mmmmmm:000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CimInterval {
    pub days: u32,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub microseconds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CimDateTime {
    Timestamp(CimTimestamp),
    Interval(CimInterval),
}

impl CimDateTime {
    /// Parse the canonical 25-character form. Returns a message (no
    /// position) on failure; callers attach wire context.
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.len() != 25 || !s.is_ascii() {
            return Err(format!(
                "datetime value must be exactly 25 ASCII characters, got {:?}",
                s
            ));
        }
        let bytes = s.as_bytes();
        if bytes[14] != b'.' {
            return Err(format!("datetime value {s:?} lacks '.' at offset 14"));
        }
        match bytes[21] {
            b'+' | b'-' => {
                let ts = CimTimestamp {
                    year: field(s, 0, 4)? as u16,
                    month: checked(field(s, 4, 6)?, 1, 12, "month")? as u8,
                    day: checked(field(s, 6, 8)?, 1, 31, "day")? as u8,
                    hour: checked(field(s, 8, 10)?, 0, 23, "hour")? as u8,
                    minute: checked(field(s, 10, 12)?, 0, 59, "minute")? as u8,
                    second: checked(field(s, 12, 14)?, 0, 59, "second")? as u8,
                    microsecond: field(s, 15, 21)?,
                    utc_offset_min: {
                        let magnitude = field(s, 22, 25)? as i16;
                        if bytes[21] == b'-' {
                            -magnitude
                        } else {
                            magnitude
                        }
                    },
                };
                Ok(CimDateTime::Timestamp(ts))
            }
            b':' => {
                if &s[22..25] != "000" {
                    return Err(format!("interval value {s:?} must end in ':000'"));
                }
                let iv = CimInterval {
                    days: field(s, 0, 8)?,
                    hours: checked(field(s, 8, 10)?, 0, 23, "hours")? as u8,
                    minutes: checked(field(s, 10, 12)?, 0, 59, "minutes")? as u8,
                    seconds: checked(field(s, 12, 14)?, 0, 59, "seconds")? as u8,
                    microseconds: field(s, 15, 21)?,
                };
                Ok(CimDateTime::Interval(iv))
            }
            other => Err(format!(
                "datetime value {s:?} has invalid separator {:?} at offset 21",
                other as char
            )),
        }
    }

    pub fn is_interval(&self) -> bool {
        matches!(self, CimDateTime::Interval(_))
    }
}

fn field(s: &str, start: usize, end: usize) -> Result<u32, String> {
    let part = &s[start..end];
    if !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("non-digit in datetime field {part:?}"));
    }
    part.parse::<u32>()
        .map_err(|_| format!("datetime field {part:?} out of range"))
}

fn checked(v: u32, min: u32, max: u32, what: &str) -> Result<u32, String> {
    if v < min || v > max {
        return Err(format!("datetime {what} {v} outside {min}..={max}"));
    }
    Ok(v)
}

impl fmt::Display for CimDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CimDateTime::Timestamp(t) => {
                let (sign, magnitude) = if t.utc_offset_min < 0 {
                    ('-', -(t.utc_offset_min as i32))
                } else {
                    ('+', t.utc_offset_min as i32)
                };
                write!(
                    f,
                    "{:04}{:02}{:02}{:02}{:02}{:02}.{:06}{}{:03}",
                    t.year,
                    t.month,
                    t.day,
                    t.hour,
                    t.minute,
                    t.second,
                    t.microsecond,
                    sign,
                    magnitude
                )
            }
            CimDateTime::Interval(i) => write!(
                f,
                "{:08}{:02}{:02}{:02}.{:06}:000",
                i.days, i.hours, i.minutes, i.seconds, i.microseconds
            ),
        }
    }
}
