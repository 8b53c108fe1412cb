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

//! 8.3 short names and long file name chunks.

use zerocopy::little_endian::U16;

use crate::defs::{
    flags, DirEntry, LfnEntry, BASENAME_LENGTH, LFN_UNIT_COUNT, NAME_LENGTH,
};

/// Rotate-add fold of an 11-byte short name, replicated in every long file
/// name chunk to detect orphaned chunks.
pub(crate) fn short_name_checksum(name: &[u8; NAME_LENGTH]) -> u8 {
    name.iter()
        .fold(0u8, |sum, &byte| sum.rotate_right(1).wrapping_add(byte))
}

/// Converts one name byte for 8.3 storage. Zero means the byte is dropped.
fn convert_character(value: u8) -> u8 {
    const FORBIDDEN: [u8; 10] = [
        0x22, 0x2A, 0x2B, 0x2C, 0x2E, 0x2F, 0x5B, 0x5C, 0x5D, 0x7C,
    ];

    if value.is_ascii_lowercase() {
        return value - (b'a' - b'A');
    }
    if value == b' ' {
        return 0;
    }
    if value > 0x20 && value < 0x7F && !(0x3A..=0x3F).contains(&value) && !FORBIDDEN.contains(&value)
    {
        return value;
    }
    b'_'
}

/// Packs `name` into the 11-byte 8.3 form, splitting at the rightmost dot
/// when `with_extension` is set. Returns whether the conversion is lossless,
/// in which case the short name alone can represent the node.
pub(crate) fn fill_short_name(short_name: &mut [u8; NAME_LENGTH], name: &str, with_extension: bool) -> bool {
    let bytes = name.as_bytes();
    let dot = if with_extension {
        bytes.iter().rposition(|&byte| byte == b'.')
    } else {
        None
    };

    let mut clean = match dot {
        None => bytes.len() <= BASENAME_LENGTH,
        Some(position) => {
            position <= BASENAME_LENGTH && bytes.len() - position <= NAME_LENGTH - BASENAME_LENGTH + 1
        }
    };

    short_name.fill(b' ');

    let mut position = 0;
    let mut index = 0;
    while index < bytes.len() {
        if dot == Some(index) {
            position = BASENAME_LENGTH;
            index += 1;
            continue;
        }

        let value = bytes[index];
        index += 1;

        let converted = convert_character(value);
        if converted != value {
            clean = false;
        }
        if converted == 0 {
            continue;
        }
        short_name[position] = converted;
        position += 1;

        if position == BASENAME_LENGTH {
            match dot {
                // Skip the remaining basename and continue with the extension.
                Some(dot) if index <= dot => index = dot + 1,
                Some(_) => {}
                None => break,
            }
        }
        if position == NAME_LENGTH {
            break;
        }
    }

    clean
}

/// Expands an 8.3 entry name into `NAME.EXT` form.
pub(crate) fn extract_short_name(entry: &DirEntry) -> String {
    let mut name = String::with_capacity(NAME_LENGTH + 1);

    for &byte in entry.basename() {
        if byte == b' ' {
            break;
        }
        name.push(byte as char);
    }

    if entry.flags & flags::DIR == 0 && entry.extension()[0] != b' ' {
        name.push('.');
        for &byte in entry.extension() {
            if byte == b' ' {
                break;
            }
            name.push(byte as char);
        }
    }

    name
}

/// Length of the expanded 8.3 name in bytes, without a terminator.
pub(crate) fn short_name_length(entry: &DirEntry) -> usize {
    let basename = entry.basename().iter().take_while(|&&byte| byte != b' ').count();

    if entry.flags & flags::DIR == 0 && entry.extension()[0] != b' ' {
        let extension = entry.extension().iter().take_while(|&&byte| byte != b' ').count();
        basename + 1 + extension
    } else {
        basename
    }
}

/// Basename bytes of a space-padded short name.
pub(crate) fn extract_basename(short_name: &[u8]) -> &[u8] {
    let length = short_name
        .iter()
        .take(BASENAME_LENGTH)
        .take_while(|&&byte| byte != b' ' && byte != 0)
        .count();
    &short_name[..length]
}

/// Splits a `BASE~N` basename into the prefix length and the instance N.
pub(crate) fn unique_name_instance(basename: &[u8]) -> Option<(usize, usize)> {
    let tilde = basename.iter().rposition(|&byte| byte == b'~')?;
    let digits = &basename[tilde + 1..];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }

    let instance = digits
        .iter()
        .fold(0usize, |value, &digit| value * 10 + usize::from(digit - b'0'));
    (instance > 0).then_some((tilde, instance))
}

/// Builds a `BASE~N` basename, truncating the base to make room for the
/// suffix. The extension part of `short_name` is left untouched.
pub(crate) fn build_unique_name(short_name: &mut [u8; NAME_LENGTH], basename: &[u8], instance: usize) {
    let mut digits = [0u8; BASENAME_LENGTH];
    let mut count = 0;
    let mut value = instance;
    while value != 0 {
        digits[count] = b'0' + (value % 10) as u8;
        value /= 10;
        count += 1;
    }

    let base_length = basename.len().min(BASENAME_LENGTH - count - 1);
    short_name[..BASENAME_LENGTH].fill(b' ');
    short_name[..base_length].copy_from_slice(&basename[..base_length]);
    short_name[base_length] = b'~';
    for index in 0..count {
        short_name[base_length + 1 + index] = digits[count - 1 - index];
    }
}

/// The 13 UTF-16 code units of a long file name chunk, in name order.
pub(crate) fn extract_lfn_units(entry: &LfnEntry, units: &mut [u16; LFN_UNIT_COUNT]) {
    let parts = entry
        .unit_0
        .iter()
        .chain(entry.unit_1.iter())
        .chain(entry.unit_2.iter());
    for (unit, part) in units.iter_mut().zip(parts) {
        *unit = part.get();
    }
}

/// Stores up to 13 UTF-16 code units into a chunk; a partial chunk carries a
/// single NUL terminator followed by 0xFFFF padding.
pub(crate) fn fill_lfn_units(entry: &mut LfnEntry, units: &[u16]) {
    let mut buffer = [0xFFFFu16; LFN_UNIT_COUNT];
    buffer[..units.len()].copy_from_slice(units);
    if units.len() < LFN_UNIT_COUNT {
        buffer[units.len()] = 0;
    }

    let parts = entry
        .unit_0
        .iter_mut()
        .chain(entry.unit_1.iter_mut())
        .chain(entry.unit_2.iter_mut());
    for (part, unit) in parts.zip(buffer) {
        *part = U16::new(unit);
    }
}

/// Fills the fixed fields of a long file name chunk.
pub(crate) fn fill_lfn_header(entry: &mut LfnEntry, ordinal: u8, total: u8, checksum: u8) {
    entry.flags = flags::MASK_LFN;
    entry.reserved_0 = 0;
    entry.reserved_1 = U16::ZERO;
    entry.checksum = checksum;
    entry.ordinal = if ordinal == total {
        ordinal | flags::LFN_LAST
    } else {
        ordinal
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short(name: &str, with_extension: bool) -> ([u8; NAME_LENGTH], bool) {
        let mut buffer = [0; NAME_LENGTH];
        let clean = fill_short_name(&mut buffer, name, with_extension);
        (buffer, clean)
    }

    #[test]
    fn checksum_folds_the_short_name() {
        // Reference value for "README  TXT" computed by the rotate-add fold.
        let mut sum = 0u8;
        for &byte in b"README  TXT" {
            sum = sum.rotate_right(1).wrapping_add(byte);
        }
        assert_eq!(short_name_checksum(b"README  TXT"), sum);
        assert_ne!(short_name_checksum(b"README  TXT"), short_name_checksum(b"README  TXR"));
    }

    #[test]
    fn lossless_short_names() {
        assert_eq!(short("ALIG.TXT", true), (*b"ALIG    TXT", true));
        assert_eq!(short("NOEXT", true), (*b"NOEXT      ", true));
        assert_eq!(short("SHORT.A", true), (*b"SHORT   A  ", true));
        assert_eq!(short("SYS", false), (*b"SYS        ", true));
    }

    #[test]
    fn lossy_short_names() {
        // Lowercase characters fold to upper case and require a long name.
        assert_eq!(short("readme.txt", true), (*b"README  TXT", false));
        // Overlong components truncate.
        assert_eq!(short("LONGBASENAME.TEXT", true), (*b"LONGBASETEX", false));
        // Forbidden bytes turn into underscores, spaces are dropped.
        assert_eq!(short("A+B C.TXT", true), (*b"A_BC    TXT", false));
        // Inner dots are not name separators.
        assert_eq!(short("A.B.C", true), (*b"A_B     C  ", false));
        // Multibyte characters degrade bytewise.
        assert_eq!(short("ä.txt", true), (*b"__      TXT", false));
    }

    #[test]
    fn directories_take_no_extension() {
        assert_eq!(short("HOME.D", false), (*b"HOME_D     ", false));
    }

    #[test]
    fn short_name_expansion() {
        let mut entry = DirEntry {
            name: *b"ALIG    TXT",
            flags: 0,
            reserved_0: 0,
            reserved_1: 0,
            reserved_2: [0; 6],
            cluster_high: U16::ZERO,
            time: U16::ZERO,
            date: U16::ZERO,
            cluster_low: U16::ZERO,
            size: zerocopy::little_endian::U32::ZERO,
        };
        assert_eq!(extract_short_name(&entry), "ALIG.TXT");
        assert_eq!(short_name_length(&entry), 8);

        entry.name = *b"HOME       ";
        entry.flags = flags::DIR;
        assert_eq!(extract_short_name(&entry), "HOME");
        assert_eq!(short_name_length(&entry), 4);
    }

    #[test]
    fn unique_name_parsing() {
        assert_eq!(unique_name_instance(b"FOO~1"), Some((3, 1)));
        assert_eq!(unique_name_instance(b"FOO~42"), Some((3, 42)));
        assert_eq!(unique_name_instance(b"FOO~"), None);
        assert_eq!(unique_name_instance(b"FOO~X1"), None);
        assert_eq!(unique_name_instance(b"FOO"), None);
        assert_eq!(unique_name_instance(b"FOO~0"), None);
    }

    #[test]
    fn unique_name_building() {
        let mut name = *b"FOO     TXT";
        build_unique_name(&mut name, b"FOO", 1);
        assert_eq!(&name, b"FOO~1   TXT");

        let mut name = *b"LONGBASETXT";
        build_unique_name(&mut name, b"LONGBASE", 12);
        assert_eq!(&name, b"LONGB~12TXT");
    }

    #[test]
    fn lfn_chunk_round_trip() {
        let mut entry = LfnEntry {
            ordinal: 0,
            unit_0: [U16::ZERO; 5],
            flags: 0,
            reserved_0: 0,
            checksum: 0,
            unit_1: [U16::ZERO; 6],
            reserved_1: U16::ZERO,
            unit_2: [U16::ZERO; 2],
        };

        let tail: Vec<u16> = "name.txt".encode_utf16().collect();
        fill_lfn_units(&mut entry, &tail);
        fill_lfn_header(&mut entry, 1, 1, 0x42);

        assert_eq!(entry.ordinal, 1 | flags::LFN_LAST);
        assert_eq!(entry.flags, flags::MASK_LFN);
        assert_eq!(entry.checksum, 0x42);

        let mut units = [0u16; LFN_UNIT_COUNT];
        extract_lfn_units(&entry, &mut units);
        assert_eq!(&units[..8], tail.as_slice());
        assert_eq!(units[8], 0);
        assert_eq!(units[9], 0xFFFF);
        assert_eq!(units[12], 0xFFFF);
    }
}
