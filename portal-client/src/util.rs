use std::{collections::HashSet, sync::Mutex, time::Duration};

/// `1234567` -> `"1,234,567"`
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);

    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }

    out
}

/// Like [`format_number`] but keeps up to two decimals, used for percentages.
pub fn format_decimal(v: f64) -> String {
    let v = if v.is_finite() { v.max(0.0) } else { 0.0 };
    let whole = v.trunc() as u64;
    let frac = ((v - v.trunc()) * 100.0).round() as u64;

    match frac {
        0 => format_number(whole),
        100 => format_number(whole + 1),
        f if f % 10 == 0 => format!("{}.{}", format_number(whole), f / 10),
        f => format!("{}.{:02}", format_number(whole), f),
    }
}

pub fn human_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{value:.2} {}", UNITS[unit])
}

pub fn display_estimated_time(eta: Option<Duration>) -> String {
    let Some(eta) = eta else {
        return "ETA: unknown".to_owned();
    };

    let secs = eta.as_secs();
    if secs == 0 {
        return "ETA: now".to_owned();
    }

    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("ETA: {s}s"),
        (0, _) => format!("ETA: {m}m {s}s"),
        _ => format!("ETA: {h}h {m}m"),
    }
}

/// Remembers which messages were already logged by its owner.
#[derive(Debug, Default)]
pub struct WarnOnce {
    seen: Mutex<HashSet<String>>,
}

impl WarnOnce {
    /// Logs `message` at warn level unless it was logged before. Returns whether it was logged.
    pub fn warn(&self, message: &str) -> bool {
        let first = match self.seen.lock() {
            Ok(mut seen) => seen.insert(message.to_owned()),
            Err(poisoned) => poisoned.into_inner().insert(message.to_owned()),
        };

        if first {
            log::warn!("{message}");
        }

        first
    }
}
