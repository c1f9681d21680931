use chrono::{DateTime, Utc};

pub type Timestamp = DateTime<Utc>;

/// Seconds elapsed between `since` and `now`, saturating at zero if `now`
/// precedes `since` (clock skew / out-of-order delivery).
pub fn elapsed_secs(since: Timestamp, now: Timestamp) -> i64 {
    (now - since).num_seconds().max(0)
}

/// Whether `now` is at least `deadline_secs` past `since` — used for the
/// node heartbeat deadline (§5) and the attestation staleness check (§4.F).
pub fn is_stale(since: Timestamp, now: Timestamp, deadline_secs: i64) -> bool {
    elapsed_secs(since, now) >= deadline_secs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn stale_after_deadline() {
        let since = Utc::now();
        let now = since + Duration::seconds(91);
        assert!(is_stale(since, now, 90));
        assert!(!is_stale(since, since + Duration::seconds(89), 90));
    }

    #[test]
    fn elapsed_never_negative() {
        let since = Utc::now();
        let earlier = since - Duration::seconds(5);
        assert_eq!(elapsed_secs(since, earlier), 0);
    }
}
