// Copyright (C) 2024 The netvu authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `Label: value` text metadata, as found in JFIF comment segments and MIME
//! `text/plain` parts.
//!
//! ```text
//! Number: 1
//! Name: Car park
//! Date: 15/03/2020
//! Time: 10:30:00
//! MSec: 250
//! ```

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use log::debug;

use super::pic::{PictureHeader, PIC_VERSION};
use super::AdditionalText;

/// Which set of labels to recognize.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Vocabulary {
    /// The comment segment of a server-generated JFIF image.
    Jfif,

    /// The text part following an MPEG-4 or H.264 frame in a MIME stream.
    Mime,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Field {
    Version,
    Name,
    Number,
    Date,
    Time,
    MSec,
    QFactor,
    AlarmText,
    ActiveAlarms,
    ActiveDetectors,
    Comments,
    Locale,
    UtcOffset,
}

const JFIF_LABELS: [(&str, Field); 13] = [
    ("Version: ", Field::Version),
    ("Name: ", Field::Name),
    ("Number: ", Field::Number),
    ("Date: ", Field::Date),
    ("Time: ", Field::Time),
    ("MSec: ", Field::MSec),
    ("Q-Factor: ", Field::QFactor),
    ("Alarm-text: ", Field::AlarmText),
    ("Active-alarms: ", Field::ActiveAlarms),
    ("Active-detectors: ", Field::ActiveDetectors),
    ("Comments: ", Field::Comments),
    ("Locale: ", Field::Locale),
    ("UTCoffset: ", Field::UtcOffset),
];

const MIME_LABELS: [(&str, Field); 8] = [
    ("Number: ", Field::Number),
    ("Name: ", Field::Name),
    ("Version: ", Field::Version),
    ("Date: ", Field::Date),
    ("Time: ", Field::Time),
    ("MSec: ", Field::MSec),
    ("Locale: ", Field::Locale),
    ("UTCoffset: ", Field::UtcOffset),
];

impl Vocabulary {
    fn labels(self) -> &'static [(&'static str, Field)] {
        match self {
            Vocabulary::Jfif => &JFIF_LABELS,
            Vocabulary::Mime => &MIME_LABELS,
        }
    }
}

/// Applies each recognized line of `text` to `header`; everything else goes
/// to `additional`.
///
/// Parsing stops at the first NUL. `session_time` is set only once both a
/// date and a time have been seen; they're interpreted as UTC.
pub fn parse(
    vocabulary: Vocabulary,
    text: &[u8],
    header: &mut PictureHeader,
    additional: &mut AdditionalText,
) {
    let text = match text.iter().position(|&b| b == 0) {
        Some(nul) => &text[..nul],
        None => text,
    };
    let mut date = None;
    let mut time = None;
    for line in text.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let found = vocabulary
            .labels()
            .iter()
            .find(|(label, _)| line.starts_with(label.as_bytes()));
        let Some(&(label, field)) = found else {
            additional.push_line(line);
            continue;
        };
        let value = super::pic::latin1(&line[label.len()..]);
        let value = value.trim();
        let ok = match field {
            Field::Comments => {
                additional.push_line(line);
                true
            }
            Field::Version => apply(parse_hex(value), |v| {
                header.version = if super::pic::is_valid_version(v) {
                    v
                } else {
                    PIC_VERSION
                };
            }),
            Field::Name => {
                header.title = value.to_owned();
                true
            }
            Field::Number => value.parse().map(|n| header.cam = n).is_ok(),
            Field::Date => apply(parse_date(value), |d| date = Some(d)),
            Field::Time => apply(parse_time(value), |t| time = Some(t)),
            Field::MSec => value.parse().map(|ms| header.milliseconds = ms).is_ok(),
            Field::QFactor => value.parse().map(|q| header.factor = q).is_ok(),
            Field::AlarmText => {
                header.alarm = value.to_owned();
                true
            }
            Field::ActiveAlarms => apply(parse_hex64(value), |mask| {
                header.alm_bitmask = mask as u32;
                header.alm_bitmask_hi = (mask >> 32) as u32;
            }),
            Field::ActiveDetectors => apply(parse_hex(value), |mask| header.status = mask as i32),
            Field::Locale => {
                header.locale = value.to_owned();
                true
            }
            Field::UtcOffset => value
                .trim_start_matches('+')
                .parse()
                .map(|o| header.utc_offset = o)
                .is_ok(),
        };
        if !ok {
            debug!("ignoring unparseable {:?} value {:?}", field, value);
        }
    }
    if let (Some(d), Some(t)) = (date, time) {
        let secs = NaiveDateTime::new(d, t).and_utc().timestamp();
        match u32::try_from(secs) {
            Ok(s) => header.session_time = s,
            Err(_) => debug!("{d} {t} is outside the picture header's time range"),
        }
    }
}

/// Applies `f` to a successfully parsed value, returning whether there was one.
fn apply<T>(v: Option<T>, f: impl FnOnce(T)) -> bool {
    v.map(f).is_some()
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

fn parse_hex(s: &str) -> Option<u32> {
    u32::from_str_radix(strip_0x(s), 16).ok()
}

fn parse_hex64(s: &str) -> Option<u64> {
    u64::from_str_radix(strip_0x(s), 16).ok()
}

/// Parses `dd/mm/yyyy`.
fn parse_date(s: &str) -> Option<NaiveDate> {
    let mut parts = s.splitn(3, '/');
    let d = u32::from_str_radix(parts.next()?, 10).ok()?;
    let m = u32::from_str_radix(parts.next()?, 10).ok()?;
    let y = i32::from_str_radix(parts.next()?, 10).ok()?;
    NaiveDate::from_ymd_opt(y, m, d)
}

/// Parses `hh:mm:ss`.
fn parse_time(s: &str) -> Option<NaiveTime> {
    let mut parts = s.splitn(3, ':');
    let h = u32::from_str_radix(parts.next()?, 10).ok()?;
    let m = u32::from_str_radix(parts.next()?, 10).ok()?;
    let sec = u32::from_str_radix(parts.next()?, 10).ok()?;
    NaiveTime::from_hms_opt(h, m, sec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_jfif(text: &[u8]) -> (PictureHeader, AdditionalText) {
        let mut h = PictureHeader::default();
        let mut extra = AdditionalText::default();
        parse(Vocabulary::Jfif, text, &mut h, &mut extra);
        (h, extra)
    }

    #[test]
    fn jfif_comment() {
        let (h, extra) = parse_jfif(
            b"Version: 0xDECADE11\r\n\
              Number: 2\r\n\
              Name: Car park\r\n\
              Date: 15/03/2020\r\n\
              Time: 10:30:00\r\n\
              MSec: 250\r\n\
              Q-Factor: 40\r\n\
              Alarm-text: Gate\r\n\
              Active-alarms: 100000003\r\n\
              Active-detectors: 0x10\r\n\
              Locale: UK\r\n\
              UTCoffset: +60\r\n\
              Comments: shift 2\r\n\
              Site: Depot\r\n",
        );
        assert_eq!(h.version, PIC_VERSION);
        assert_eq!(h.cam, 2);
        assert_eq!(h.title, "Car park");
        assert_eq!(h.session_time, 1_584_268_200);
        assert_eq!(h.milliseconds, 250);
        assert_eq!(h.factor, 40);
        assert_eq!(h.alarm, "Gate");
        assert_eq!(h.alm_bitmask, 3);
        assert_eq!(h.alm_bitmask_hi, 1);
        assert_eq!(h.status, 0x10);
        assert_eq!(h.locale, "UK");
        assert_eq!(h.utc_offset, 60);
        assert_eq!(extra.as_bytes(), b"Comments: shift 2\r\nSite: Depot\r\n");
    }

    #[test]
    fn stops_at_nul() {
        let (h, extra) = parse_jfif(b"Number: 5\n\0Number: 6\nJunk\n");
        assert_eq!(h.cam, 5);
        assert!(extra.is_empty());
    }

    #[test]
    fn time_before_date() {
        let (h, _) = parse_jfif(b"Time: 10:30:00\r\nDate: 15/03/2020\r\n");
        assert_eq!(h.session_time, 1_584_268_200);
    }

    #[test]
    fn time_without_date_leaves_session_time() {
        let (h, _) = parse_jfif(b"Time: 10:30:00\n");
        assert_eq!(h.session_time, 0);
    }

    #[test]
    fn mime_vocabulary_has_no_q_factor() {
        let mut h = PictureHeader::default();
        let mut extra = AdditionalText::default();
        parse(
            Vocabulary::Mime,
            b"Number: 1\r\nQ-Factor: 40\r\nUTCoffset: -300\r\n",
            &mut h,
            &mut extra,
        );
        assert_eq!(h.cam, 1);
        assert_eq!(h.factor, 0);
        assert_eq!(h.utc_offset, -300);
        assert_eq!(extra.as_bytes(), b"Q-Factor: 40\r\n");
    }

    #[test]
    fn bad_values_ignored() {
        let (h, extra) = parse_jfif(b"Number: two\nDate: 31/02/2020\nTime: 10:30:00\n");
        assert_eq!(h.cam, 0);
        assert_eq!(h.session_time, 0);
        assert!(extra.is_empty());
    }
}
