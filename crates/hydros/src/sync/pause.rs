//! The pause and takeover annotations.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;

use crate::error::{HydrosError, Result};
use crate::resource::{PAUSE_ANNOTATION, TAKEOVER_ANNOTATION};

static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap()
});

/// Parses `90m`, `2h`, `1h30m`, `1d` and similar.
///
/// Values too large to represent are an error, not a saturated or zero duration.
pub fn parse_duration(value: &str) -> Result<TimeDelta> {
    let trimmed = value.trim();
    let caps = match DURATION.captures(trimmed) {
        Some(caps) if !trimmed.is_empty() => caps,
        _ => {
            return Err(HydrosError::Validation(format!(
                "{} must be an RFC 3339 time or a duration like 2h or 1h30m, got '{}'",
                PAUSE_ANNOTATION, value
            )))
        }
    };

    let units: [fn(i64) -> Option<TimeDelta>; 4] = [
        TimeDelta::try_days,
        TimeDelta::try_hours,
        TimeDelta::try_minutes,
        TimeDelta::try_seconds,
    ];
    let mut total = TimeDelta::zero();
    for (group, unit) in units.iter().enumerate() {
        let Some(digits) = caps.get(group + 1) else {
            continue;
        };
        total = digits
            .as_str()
            .parse::<i64>()
            .ok()
            .and_then(unit)
            .and_then(|part| total.checked_add(&part))
            .ok_or_else(|| out_of_range(value))?;
    }
    Ok(total)
}

/// An RFC 3339 timestamp, or a duration counted from `now`.
pub fn parse_pause(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value.trim()) {
        return Ok(at.with_timezone(&Utc));
    }
    let duration = parse_duration(value)?;
    now.checked_add_signed(duration)
        .ok_or_else(|| out_of_range(value))
}

fn out_of_range(value: &str) -> HydrosError {
    HydrosError::Validation(format!(
        "{} duration '{}' is out of range",
        PAUSE_ANNOTATION, value
    ))
}

pub fn is_takeover(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(TAKEOVER_ANNOTATION)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Pause window remembered across passes of one syncer.
///
/// A duration is anchored to the pass that first saw the annotation value,
/// so an unchanged `2h` does not keep pushing the window forward.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PauseState {
    observed: Option<String>,
    until: Option<DateTime<Utc>>,
}

impl PauseState {
    /// Updates the window from the current annotations.
    pub fn observe(
        &mut self,
        annotations: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        match annotations.get(PAUSE_ANNOTATION) {
            None => {
                self.observed = None;
                self.until = None;
            }
            Some(value) if self.observed.as_deref() == Some(value.as_str()) => {}
            Some(value) => {
                let until = parse_pause(value, now)?;
                log::info!("Paused until {}", until.to_rfc3339());
                self.observed = Some(value.clone());
                self.until = Some(until);
            }
        }
        Ok(self.until)
    }

    pub fn until(&self) -> Option<DateTime<Utc>> {
        self.until
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.until.is_some_and(|until| until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::hours(2));
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::hours(1) + Duration::minutes(30)
        );
        assert_eq!(parse_duration("1d").unwrap(), Duration::days(1));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("30m2h").is_err());
    }

    #[test]
    fn test_oversized_durations_are_errors() {
        // Fits in a duration but not in a timestamp.
        assert!(matches!(
            parse_pause("99999999d", now()),
            Err(HydrosError::Validation(_))
        ));
        // Too many days for a duration.
        assert!(matches!(
            parse_duration("200000000000d"),
            Err(HydrosError::Validation(_))
        ));
        // Digits beyond i64.
        let err = parse_duration("99999999999999999999s").unwrap_err();
        assert!(err.to_string().contains("out of range"), "{}", err);
        // Parts that overflow only once summed.
        assert!(parse_duration("106751991167d23h").is_err());
    }

    #[test]
    fn test_parse_pause() {
        assert_eq!(
            parse_pause("2024-05-02T00:00:00Z", now()).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_pause("2h", now()).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap()
        );
        assert!(parse_pause("tomorrow", now()).is_err());
    }

    #[test]
    fn test_duration_is_anchored_to_first_observation() {
        let mut state = PauseState::default();
        let pause = annotations(&[(PAUSE_ANNOTATION, "2h")]);

        let first = state.observe(&pause, now()).unwrap();
        let later = state.observe(&pause, now() + Duration::hours(1)).unwrap();
        assert_eq!(first, later);
        assert!(state.is_active(now() + Duration::minutes(119)));
        assert!(!state.is_active(now() + Duration::hours(3)));

        state.observe(&BTreeMap::new(), now()).unwrap();
        assert_eq!(state.until(), None);
    }

    #[test]
    fn test_takeover() {
        assert!(is_takeover(&annotations(&[(TAKEOVER_ANNOTATION, "true")])));
        assert!(!is_takeover(&annotations(&[(TAKEOVER_ANNOTATION, "no")])));
        assert!(!is_takeover(&BTreeMap::new()));
    }
}
