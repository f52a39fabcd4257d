//! PAN synthesis and validation.
//!
//! PANs are built as `BIN + random fill + Luhn check digit`. Fill digits come
//! from [`random::random_digits`], which rejection-samples bytes so every digit
//! is equally likely.

pub mod random;

use std::error::Error as StdError;
use std::future::{Future, ready};

use crate::retry::{RetryError, retry_bounded};

pub use random::random_digits;

pub const DEFAULT_PAN_LENGTH: usize = 16;
pub const MIN_PAN_LENGTH: usize = 13;
pub const MAX_PAN_LENGTH: usize = 19;
pub const DEFAULT_UNIQUE_RETRIES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum PanError {
    #[error("bin is required")]
    MissingBin,

    #[error("bin must contain digits only")]
    BinNotNumeric,

    #[error("bin must be 6, 8, or 9 digits (got {0})")]
    BinLength(usize),

    #[error("total length must be 13..19 (got {0})")]
    TotalLength(usize),

    #[error("bin too long for a {total_len}-digit pan: {bin}")]
    BinTooLong { bin: String, total_len: usize },

    #[error("sequence must be numeric")]
    SequenceNotNumeric,

    #[error("sequence length {len} exceeds fill length {fill}")]
    SequenceTooLong { len: usize, fill: usize },

    #[error("pan is required")]
    MissingPan,

    #[error("pan must contain digits only")]
    PanNotNumeric,

    #[error("pan length must be 13..19 digits (got {0})")]
    PanLength(usize),

    #[error("invalid luhn check digit")]
    CheckDigit,

    #[error("exists check failed: {0}")]
    ExistsCheck(#[source] Box<dyn StdError + Send + Sync>),

    #[error("failed to generate unique pan after {attempts} attempts")]
    Exhausted { attempts: usize },
}

pub fn is_digits(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}

pub fn validate_bin(bin: &str) -> Result<(), PanError> {
    if bin.is_empty() {
        return Err(PanError::MissingBin);
    }
    if !is_digits(bin) {
        return Err(PanError::BinNotNumeric);
    }
    match bin.len() {
        6 | 8 | 9 => Ok(()),
        other => Err(PanError::BinLength(other)),
    }
}

/// Luhn check digit for `body`, which must be ASCII digits.
pub fn luhn_check_digit(body: &str) -> char {
    let sum: u32 = body
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();

    char::from(b'0' + ((10 - sum % 10) % 10) as u8)
}

/// 16-digit PAN for `bin`. See [`generate_pan_with_length`].
pub fn generate_pan(bin: &str, sequence: &str) -> Result<String, PanError> {
    generate_pan_with_length(bin, DEFAULT_PAN_LENGTH, sequence)
}

/// Generate a Luhn-valid PAN of `total_len` digits starting with `bin`.
///
/// A non-empty `sequence` overwrites the trailing fill digits just before the
/// check digit.
pub fn generate_pan_with_length(
    bin: &str,
    total_len: usize,
    sequence: &str,
) -> Result<String, PanError> {
    validate_bin(bin)?;
    if !(MIN_PAN_LENGTH..=MAX_PAN_LENGTH).contains(&total_len) {
        return Err(PanError::TotalLength(total_len));
    }

    let fill = total_len.saturating_sub(1 + bin.len());
    if fill == 0 {
        return Err(PanError::BinTooLong {
            bin: bin.to_string(),
            total_len,
        });
    }

    let sequence = sequence.trim();
    if !is_digits(sequence) {
        return Err(PanError::SequenceNotNumeric);
    }
    if sequence.len() > fill {
        return Err(PanError::SequenceTooLong {
            len: sequence.len(),
            fill,
        });
    }

    let random_part = random_digits(fill - sequence.len());
    let mut pan = String::with_capacity(total_len);
    pan.push_str(bin);
    pan.push_str(&random_part);
    pan.push_str(sequence);
    let check = luhn_check_digit(&pan);
    pan.push(check);

    Ok(pan)
}

pub fn validate_pan(pan: &str) -> Result<(), PanError> {
    if pan.is_empty() {
        return Err(PanError::MissingPan);
    }
    if !is_digits(pan) {
        return Err(PanError::PanNotNumeric);
    }
    if !(MIN_PAN_LENGTH..=MAX_PAN_LENGTH).contains(&pan.len()) {
        return Err(PanError::PanLength(pan.len()));
    }

    let (body, check) = pan.split_at(pan.len() - 1);
    if check.chars().next() != Some(luhn_check_digit(body)) {
        return Err(PanError::CheckDigit);
    }
    Ok(())
}

/// Generate PANs until `exists` reports one as unused.
///
/// `max_retries` of zero falls back to [`DEFAULT_UNIQUE_RETRIES`]; the loop
/// makes `max_retries + 1` attempts in total.
pub async fn generate_unique_pan<F, Fut, E>(
    bin: &str,
    total_len: usize,
    sequence: &str,
    max_retries: usize,
    mut exists: F,
) -> Result<String, PanError>
where
    F: FnMut(&str) -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    let max_retries = if max_retries == 0 {
        DEFAULT_UNIQUE_RETRIES
    } else {
        max_retries
    };

    let result = retry_bounded(
        max_retries + 1,
        || ready(generate_pan_with_length(bin, total_len, sequence)),
        |pan: &String| {
            let check = exists(pan.as_str());
            async move {
                check
                    .await
                    .map(|used| !used)
                    .map_err(|e| PanError::ExistsCheck(e.into()))
            }
        },
    )
    .await;

    match result {
        Ok(pan) => Ok(pan),
        Err(RetryError::Exhausted { attempts }) => Err(PanError::Exhausted { attempts }),
        Err(RetryError::Failed(e)) => Err(e),
    }
}

/// Strip spaces, tabs and dashes.
pub fn normalize_pan(pan: &str) -> String {
    pan.trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '\t' | '-'))
        .collect()
}

pub fn last_n(s: &str, n: usize) -> &str {
    if s.len() <= n { s } else { &s[s.len() - n..] }
}

/// Mask a PAN for display: first 6 and last 4 stay visible on PANs of 10+
/// digits, shorter inputs keep only the last 4.
pub fn mask_pan(pan: &str) -> String {
    let cleaned = normalize_pan(pan);
    let n = cleaned.len();
    match n {
        0 => String::new(),
        1..=4 => "*".repeat(n),
        5..=9 => format!("{}{}", "*".repeat(n - 4), &cleaned[n - 4..]),
        _ => format!(
            "{}{}{}",
            &cleaned[..6],
            "*".repeat(n - 10),
            &cleaned[n - 4..]
        ),
    }
}
