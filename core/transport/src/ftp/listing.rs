//! LIST / MLSD response parser.
//!
//! Two formats are understood:
//! 1. **MLSD facts** (RFC 3659): `type=file;size=1234;modify=20260101120000; file.txt`
//! 2. **Unix-style** (`ls -l`): `-rw-r--r-- 1 owner group 1234 Jan  1 12:00 file.txt`
//!
//! Lines in neither format are dropped.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::transport::{EntryKind, RemoteEntry};

static UNIX_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^([dlcbps-])[rwxsStT-]{9}[+@.]?\s+  # type + permissions
        \d+\s+                              # link count
        \S+\s+                              # owner
        (?:\S+\s+)?                         # group
        (\d+)\s+                            # size
        (\w{3})\s+(\d{1,2})\s+([\d:]+)\s    # date
        (.+)$                               # name, possibly with -> target
        ",
    )
    .expect("static regex")
});

/// Parse a full LIST or MLSD body.
pub fn parse_listing(raw: &str, now: DateTime<Utc>) -> Vec<RemoteEntry> {
    raw.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            if line.contains('=') && line.contains(';') {
                parse_mlsd(line)
            } else {
                parse_unix(line, now)
            }
        })
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

fn parse_mlsd(line: &str) -> Option<RemoteEntry> {
    let (facts, name) = line.split_once("; ")?;
    if name.is_empty() {
        return None;
    }

    let mut kind = EntryKind::Other;
    let mut size = 0;
    let mut modified = None;
    for fact in facts.split(';') {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                kind = match value.to_ascii_lowercase().as_str() {
                    "file" => EntryKind::File,
                    "dir" => EntryKind::Directory,
                    // Current and parent directory entries
                    "cdir" | "pdir" => return None,
                    v if v.contains("slink") || v.contains("symlink") => EntryKind::Symlink,
                    _ => EntryKind::Other,
                }
            }
            "size" | "sizd" => size = value.parse().unwrap_or(0),
            "modify" => modified = parse_mlsd_time(value),
            _ => {}
        }
    }

    Some(RemoteEntry {
        name: name.to_string(),
        kind,
        size: if kind == EntryKind::Directory { 0 } else { size },
        modified,
    })
}

/// Parse `YYYYMMDDHHMMSS[.sss]`, always UTC.
fn parse_mlsd_time(value: &str) -> Option<DateTime<Utc>> {
    let base = value.get(..14)?;
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

fn parse_unix(line: &str, now: DateTime<Utc>) -> Option<RemoteEntry> {
    let caps = UNIX_LINE.captures(line)?;

    let kind = match &caps[1] {
        "d" => EntryKind::Directory,
        "-" => EntryKind::File,
        "l" => EntryKind::Symlink,
        _ => EntryKind::Other,
    };
    let size = caps[2].parse().unwrap_or(0);
    let modified = parse_unix_date(&caps[3], &caps[4], &caps[5], now);

    let raw_name = &caps[6];
    let name = match kind {
        EntryKind::Symlink => raw_name
            .split_once(" -> ")
            .map(|(n, _)| n)
            .unwrap_or(raw_name),
        _ => raw_name,
    };

    Some(RemoteEntry {
        name: name.to_string(),
        kind,
        size: if kind == EntryKind::Directory { 0 } else { size },
        modified,
    })
}

/// `Jan  1 12:00` (year omitted: within the last six months) or `Jan  1  2025`.
fn parse_unix_date(month: &str, day: &str, time_or_year: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let month = month_number(month)?;
    let day: u32 = day.parse().ok()?;

    if let Some((hour, minute)) = time_or_year.split_once(':') {
        let hour: u32 = hour.parse().ok()?;
        let minute: u32 = minute.parse().ok()?;
        let at = |year: i32| {
            NaiveDate::from_ymd_opt(year, month, day)
                .and_then(|d| d.and_hms_opt(hour, minute, 0))
                .map(|dt| Utc.from_utc_datetime(&dt))
        };
        let this_year = at(now.year())?;
        // Servers omit the year for recent files; a date in the future
        // belongs to last year.
        if this_year > now + Duration::days(1) {
            at(now.year() - 1)
        } else {
            Some(this_year)
        }
    } else {
        let year: i32 = time_or_year.parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Utc.from_utc_datetime(&dt))
    }
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = name.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|i| i as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_unix_pattern_compiles() {
        assert!(UNIX_LINE.is_match("-rw-r--r-- 1 owner group 12 Jan  1 12:00 a.txt"));
        assert!(!UNIX_LINE.is_match("total 12"));
    }

    #[test]
    fn test_mlsd_entries() {
        let raw = "type=cdir;modify=20260101000000; .\r\n\
                   type=file;size=1234;modify=20260102030405.123; index.html\r\n\
                   type=dir;modify=20260101000000; assets\r\n";
        let entries = parse_listing(raw, now());
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].name, "index.html");
        assert!(entries[0].is_file());
        assert_eq!(entries[0].size, 1234);
        assert_eq!(
            entries[0].modified,
            Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap())
        );

        assert_eq!(entries[1].name, "assets");
        assert!(entries[1].is_directory());
    }

    #[test]
    fn test_mlsd_name_with_spaces() {
        let entries = parse_listing("type=file;size=1; my file.txt", now());
        assert_eq!(entries[0].name, "my file.txt");
    }

    #[test]
    fn test_unix_entries() {
        let raw = "drwxr-xr-x   2 www  www      4096 Jan  1 12:00 css\n\
                   -rw-r--r--   1 www  www      1234 Feb 10  2025 site map.xml\n\
                   lrwxrwxrwx   1 www  www        11 Mar  1 08:30 current -> releases/42\n";
        let entries = parse_listing(raw, now());
        assert_eq!(entries.len(), 3);

        assert!(entries[0].is_directory());
        assert_eq!(entries[0].name, "css");
        assert_eq!(
            entries[0].modified,
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap())
        );

        assert!(entries[1].is_file());
        assert_eq!(entries[1].name, "site map.xml");
        assert_eq!(entries[1].size, 1234);
        assert_eq!(
            entries[1].modified,
            Some(Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap())
        );

        assert_eq!(entries[2].kind, EntryKind::Symlink);
        assert_eq!(entries[2].name, "current");
    }

    #[test]
    fn test_unix_recent_date_in_future_is_last_year() {
        let raw = "-rw-r--r--   1 www  www  10 Dec 24 18:00 gift.txt";
        let entries = parse_listing(raw, now());
        assert_eq!(
            entries[0].modified,
            Some(Utc.with_ymd_and_hms(2025, 12, 24, 18, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_dot_entries_and_noise_skipped() {
        let raw = "total 8\n\
                   drwxr-xr-x   2 www  www  4096 Jan  1 12:00 .\n\
                   drwxr-xr-x   3 www  www  4096 Jan  1 12:00 ..\n";
        assert!(parse_listing(raw, now()).is_empty());
    }
}
