// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! FAT packed date and time. Dates count from 1980-01-01, the external
//! representation is microseconds since 1970-01-01.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use keel_fs::{Error, Result};

const FAT_EPOCH_YEAR: i32 = 1980;
const MICROSECONDS: i64 = 1_000_000;

fn fat_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(FAT_EPOCH_YEAR, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Packs microseconds since 1970 into FAT `(date, time)` words. Seconds have
/// a granularity of 2; stamps before the FAT epoch collapse to the epoch.
pub(crate) fn encode_timestamp(timestamp: i64) -> (u16, u16) {
    let value = DateTime::from_timestamp(timestamp.div_euclid(MICROSECONDS), 0)
        .map(|value| value.naive_utc())
        .filter(|value| value.year() >= FAT_EPOCH_YEAR)
        .unwrap_or_else(fat_epoch);

    let date = (value.day() as u16)
        | ((value.month() as u16) << 5)
        | (((value.year() - FAT_EPOCH_YEAR) as u16) << 9);
    let time = ((value.second() as u16) >> 1)
        | ((value.minute() as u16) << 5)
        | ((value.hour() as u16) << 11);

    (date, time)
}

/// Unpacks FAT `(date, time)` words into microseconds since 1970. A zeroed
/// date decodes to the FAT epoch; out-of-range fields fail `BadValue`.
pub(crate) fn decode_timestamp(date: u16, time: u16) -> Result<i64> {
    if date == 0 {
        return Ok(fat_epoch().and_utc().timestamp() * MICROSECONDS);
    }

    let day = u32::from(date & 0x1F);
    let month = u32::from((date >> 5) & 0x0F);
    let year = i32::from((date >> 9) & 0x7F) + FAT_EPOCH_YEAR;
    let second = u32::from(time & 0x1F) << 1;
    let minute = u32::from((time >> 5) & 0x3F);
    let hour = u32::from((time >> 11) & 0x1F);

    let value = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|value| value.and_hms_opt(hour, minute, second))
        .ok_or(Error::BadValue)?;

    Ok(value.and_utc().timestamp() * MICROSECONDS)
}
