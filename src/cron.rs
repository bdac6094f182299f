//! Deterministic expansion of schedule macros into concrete cron
//! expressions.
//!
//! Macros like `@daily-random` spread CronJob start times across the day
//! without requiring users to pick offsets. Expansion is a pure function of
//! the owning resource's UID, so a given Schedule always lands on the same
//! slot and no state is kept.

use sha2::{Digest, Sha256};

const MACROS: [&str; 5] = [
    "@hourly-random",
    "@daily-random",
    "@weekly-random",
    "@monthly-random",
    "@yearly-random",
];

/// Stable value in `[offset, offset + modulo)` derived from `seed` and
/// `salt`.
fn stable_int(seed: &str, salt: &str, modulo: u64, offset: u64) -> u64 {
    let digest = Sha256::digest(format!("{seed}:{salt}"));
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    offset + (u64::from_be_bytes(bytes) % modulo)
}

/// Expands `spec_schedule` when it is a macro. Returns the concrete cron
/// expression and whether a macro was used; plain expressions pass through
/// trimmed and unchanged.
pub fn resolve_schedule(spec_schedule: &str, uid: &str) -> (String, bool) {
    let s = spec_schedule.trim();
    if !MACROS.contains(&s) {
        return (s.to_string(), false);
    }

    let minute = stable_int(uid, "minute", 60, 0);
    let hour = stable_int(uid, "hour", 24, 0);

    let cron = match s {
        "@hourly-random" => format!("{minute} * * * *"),
        "@daily-random" => format!("{minute} {hour} * * *"),
        "@weekly-random" => {
            let dow = stable_int(uid, "dow", 7, 0);
            format!("{minute} {hour} * * {dow}")
        }
        "@monthly-random" => {
            let dom = stable_int(uid, "dom", 28, 1);
            format!("{minute} {hour} {dom} * *")
        }
        "@yearly-random" => {
            let dom = stable_int(uid, "dom", 28, 1);
            let month = stable_int(uid, "month", 12, 1);
            format!("{minute} {hour} {dom} {month} *")
        }
        _ => unreachable!("matched against MACROS above"),
    };
    (cron, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_expression_passes_through() {
        let (cron, used) = resolve_schedule("  */5 * * * *  ", "uid-1");
        assert_eq!(cron, "*/5 * * * *");
        assert!(!used);
    }

    #[test]
    fn expansion_is_deterministic_per_uid() {
        let (a, _) = resolve_schedule("@daily-random", "uid-1");
        let (b, _) = resolve_schedule("@daily-random", "uid-1");
        assert_eq!(a, b);
    }

    #[test]
    fn different_uids_generally_differ() {
        let (a, _) = resolve_schedule("@daily-random", "uid-1");
        let (b, _) = resolve_schedule("@daily-random", "uid-2");
        assert_ne!(a, b);
    }

    #[test]
    fn hourly_random_fields_in_range() {
        for i in 0..1000 {
            let (cron, used) = resolve_schedule("@hourly-random", &format!("uid-{i}"));
            assert!(used);
            let fields: Vec<&str> = cron.split(' ').collect();
            assert_eq!(fields.len(), 5);
            let minute: u64 = fields[0].parse().unwrap();
            assert!(minute < 60);
            assert_eq!(&fields[1..], &["*", "*", "*", "*"]);
        }
    }

    #[test]
    fn daily_random_fields_in_range() {
        for i in 0..1000 {
            let (cron, _) = resolve_schedule("@daily-random", &format!("uid-{i}"));
            let fields: Vec<&str> = cron.split(' ').collect();
            let minute: u64 = fields[0].parse().unwrap();
            let hour: u64 = fields[1].parse().unwrap();
            assert!(minute < 60);
            assert!(hour < 24);
            assert_eq!(&fields[2..], &["*", "*", "*"]);
        }
    }

    #[test]
    fn weekly_random_fields_in_range() {
        for i in 0..1000 {
            let (cron, _) = resolve_schedule("@weekly-random", &format!("uid-{i}"));
            let fields: Vec<&str> = cron.split(' ').collect();
            let dow: u64 = fields[4].parse().unwrap();
            assert!(dow < 7);
        }
    }

    #[test]
    fn monthly_random_fields_in_range() {
        for i in 0..1000 {
            let (cron, _) = resolve_schedule("@monthly-random", &format!("uid-{i}"));
            let fields: Vec<&str> = cron.split(' ').collect();
            let dom: u64 = fields[2].parse().unwrap();
            assert!((1..=28).contains(&dom));
        }
    }

    #[test]
    fn yearly_random_fields_in_range() {
        for i in 0..1000 {
            let (cron, _) = resolve_schedule("@yearly-random", &format!("uid-{i}"));
            let fields: Vec<&str> = cron.split(' ').collect();
            let dom: u64 = fields[2].parse().unwrap();
            let month: u64 = fields[3].parse().unwrap();
            assert!((1..=28).contains(&dom));
            assert!((1..=12).contains(&month));
        }
    }

    #[test]
    fn unknown_macro_like_string_is_passed_through() {
        let (cron, used) = resolve_schedule("@fortnightly-random", "uid-1");
        assert_eq!(cron, "@fortnightly-random");
        assert!(!used);
    }
}
