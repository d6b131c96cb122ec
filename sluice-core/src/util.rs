use crate::{Result, SessionError};
use anyhow::anyhow;
use std::{sync::Mutex, sync::MutexGuard, sync::PoisonError, time::Duration};

pub fn separated_by<T, F>(
    out: &mut String,
    values: impl IntoIterator<Item = T>,
    mut f: F,
    separator: &str,
) where
    F: FnMut(&mut String, T),
{
    let mut len = out.len();
    for v in values {
        if out.len() > len {
            out.push_str(separator);
        }
        len = out.len();
        f(out, v);
    }
}

pub fn consume_while<'s>(input: &mut &'s str, predicate: impl FnMut(&char) -> bool) -> &'s str {
    let len = input
        .chars()
        .take_while(predicate)
        .map(char::len_utf8)
        .sum::<usize>();
    if len == 0 {
        return "";
    }
    let result = &input[..len];
    *input = &input[len..];
    result
}

/// Parse a duration written as `250ms`, `2s`, `1m` or bare milliseconds (`1500`).
pub fn parse_duration(value: &str) -> Result<Duration> {
    let mut input = value.trim();
    let digits = consume_while(&mut input, char::is_ascii_digit);
    let error = || SessionError::Config(anyhow!("invalid duration `{}`", value));
    let amount: u64 = digits.parse().map_err(|_| error())?;
    match input.trim() {
        "" | "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount.saturating_mul(60))),
        _ => Err(error()),
    }
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// The guarded state is only ever mutated in short non-panicking sections, a poisoned lock
/// still holds consistent data.
pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[macro_export]
macro_rules! truncate_long {
    ($query:expr) => {{
        let query: &str = &$query;
        let end = query.char_indices().nth(497).map_or(query.len(), |(i, _)| i);
        format!(
            "{}{}",
            query[..end].trim_end(),
            if end < query.len() { "..." } else { "" },
        )
    }};
}
