//! Human-readable rendering of sizes, times and listing lines.

use jiff::{Timestamp, tz::TimeZone};

use crate::record::FileRecord;

const UNITS: [&str; 5] = ["ki", "Mi", "Gi", "Ti", "Pi"];

/// A byte count with a binary suffix: `512B`, `1.5ki`, `3Gi`.
pub fn size_str(size: u64) -> String {
    if size < 1024 {
        return format!("{size}B");
    }

    let mut value = size as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let number = format!("{value:.1}");
    let number = number.strip_suffix(".0").unwrap_or(&number);
    format!("{number}{}", UNITS[unit])
}

/// Local wall-clock time for a nanosecond timestamp.
pub fn time_str(nanos: i64) -> String {
    match Timestamp::from_nanosecond(i128::from(nanos)) {
        Ok(ts) => ts
            .to_zoned(TimeZone::system())
            .strftime("%Y-%m-%d %H:%M:%S")
            .to_string(),
        Err(_) => "-".into(),
    }
}

/// One line of `ls`-style output for a record.
pub fn listing_line(record: &FileRecord) -> String {
    let otype = record.otype.map_or('?', |otype| otype.code());
    let uname = record
        .uname
        .clone()
        .unwrap_or_else(|| record.uid.to_string());
    let gname = record
        .gname
        .clone()
        .unwrap_or_else(|| record.gid.to_string());

    format!(
        "{otype} {uname:>8}:{gname:<8} {:>7} {} {}",
        size_str(record.size),
        time_str(record.mtime),
        record.path
    )
}
