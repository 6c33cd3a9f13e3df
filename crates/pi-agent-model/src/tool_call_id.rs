// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-call id normalization quirks for providers with non-standard id
//! requirements (spec §4.C.2 / §9).
//!
//! - Mistral and Zhipu/GLM reject tool-call ids that aren't exactly nine
//!   alphanumeric characters; ids are truncated or padded to fit.
//! - Google's Gemini API does not assign tool-call ids at all; one is
//!   fabricated from the function name and an in-message counter.

const PAD_ALPHABET: &[u8] = b"ABCDEFGHI";

/// Force `id` into the 9-char alphanumeric shape Mistral/Zhipu require.
/// Non-alphanumeric characters are dropped, the result is truncated to 9
/// chars, and padded from `PAD_ALPHABET` if shorter.
pub fn pad_to_nine_alphanumeric(id: &str) -> String {
    let mut cleaned: String = id.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    cleaned.truncate(9);
    let mut pad_index = 0;
    while cleaned.len() < 9 {
        cleaned.push(PAD_ALPHABET[pad_index % PAD_ALPHABET.len()] as char);
        pad_index += 1;
    }
    cleaned
}

/// Fabricate a tool-call id for providers (Google) that never emit one:
/// `{function_name}_{counter}`.
pub fn fabricate_from_name(function_name: &str, counter: usize) -> String {
    format!("{function_name}_{counter}")
}
