//! Bucket selector parsing for `-b`.
//!
//! Two syntaxes are accepted: an inclusive range `[start,stop]`, or a list
//! of ids separated by `,` or `;`. Whitespace is ignored around every token.

use crate::error::{MigrateError, Result};

fn parse_id(bytes: &[u8], pos: &mut usize) -> Option<u16> {
    let start = *pos;
    let mut val: u32 = 0;
    while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
        val = val * 10 + u32::from(bytes[*pos] - b'0');
        if val > u32::from(u16::MAX) {
            return None;
        }
        *pos += 1;
    }
    if *pos == start {
        return None;
    }
    Some(val as u16)
}

fn skip_white(bytes: &[u8], pos: &mut usize) {
    while *pos < bytes.len() && bytes[*pos].is_ascii_whitespace() {
        *pos += 1;
    }
}

fn parse_range(buckets: &mut Vec<u16>, bytes: &[u8]) -> Option<()> {
    // syntax: [start,stop]
    let mut pos = 1;
    skip_white(bytes, &mut pos);
    let start = parse_id(bytes, &mut pos)?;
    skip_white(bytes, &mut pos);
    if bytes.get(pos) != Some(&b',') {
        return None;
    }
    pos += 1;
    skip_white(bytes, &mut pos);
    let stop = parse_id(bytes, &mut pos)?;
    skip_white(bytes, &mut pos);
    if bytes.get(pos) != Some(&b']') {
        return None;
    }
    pos += 1;
    skip_white(bytes, &mut pos);
    if pos != bytes.len() {
        return None;
    }

    buckets.extend(start..=stop);
    Some(())
}

fn parse_list(buckets: &mut Vec<u16>, bytes: &[u8]) -> Option<()> {
    let mut pos = 0;
    loop {
        buckets.push(parse_id(bytes, &mut pos)?);
        skip_white(bytes, &mut pos);
        if pos == bytes.len() {
            return Some(());
        }
        if bytes[pos] != b',' && bytes[pos] != b';' {
            return None;
        }
        pos += 1;
        skip_white(bytes, &mut pos);
        if pos == bytes.len() {
            // trailing separator
            return None;
        }
    }
}

/// Parse a single `-b` argument, appending the selected ids to `buckets`.
///
/// # Errors
///
/// Returns `MigrateError::Usage` on malformed input or ids above `u16::MAX`.
pub fn parse_buckets(buckets: &mut Vec<u16>, spec: &str) -> Result<()> {
    let trimmed = spec.trim_start();
    let bytes = trimmed.as_bytes();

    let before = buckets.len();
    let ok = match bytes.first() {
        Some(b'[') => parse_range(buckets, bytes),
        Some(_) => parse_list(buckets, bytes),
        None => None,
    };

    if ok.is_none() {
        buckets.truncate(before);
        return Err(MigrateError::usage(format!(
            "Incorrect syntax for -b: {spec}"
        )));
    }
    Ok(())
}
