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

//! UTF-16 code unit conversion used by filesystems storing UTF-16LE names.

/// UTF-16 code units of `name`, without a terminator.
pub fn to_utf16(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

/// Number of UTF-16 code units needed to store `name`, without a terminator.
pub fn utf16_length(name: &str) -> usize {
    name.encode_utf16().count()
}

/// Decodes UTF-16 code units up to the first NUL. Unpaired surrogates decode
/// to the replacement character.
pub fn from_utf16(units: &[u16]) -> String {
    char::decode_utf16(units.iter().copied().take_while(|&unit| unit != 0))
        .map(|value| value.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// UTF-8 byte length of a UTF-16 sequence, stopping at the first NUL.
pub fn utf8_length(units: &[u16]) -> usize {
    char::decode_utf16(units.iter().copied().take_while(|&unit| unit != 0))
        .map(|value| value.unwrap_or(char::REPLACEMENT_CHARACTER).len_utf8())
        .sum()
}
