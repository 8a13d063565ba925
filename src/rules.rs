//! Rule evaluator: per-element hysteresis, AND/OR combination, and
//! trailing-window rate limiting.
//!
//! These are pure functions over records and readings; `garden.rs` wires
//! them into the tick pipeline and owns the side effects (activation
//! open/close, persistence).

use time::{Duration, OffsetDateTime};

use crate::models::{Activation, Element, HysteresisTrack, LogicType, RuleLimit};

/// Whether `reading` triggers/releases/sits in-target for this element,
/// per the single threshold (`min_value` xor `max_value`) it defines.
/// Returns `None` if the element is misconfigured (`ConfigurationFault`:
/// neither or both of min/max set).
fn thresholds(element: &Element, reading: f64) -> Option<(bool, bool)> {
    match (element.min_value, element.max_value) {
        (Some(min), None) => {
            let triggered = reading <= min;
            let in_target = reading > min && reading <= element.target_value;
            Some((triggered, in_target))
        }
        (None, Some(max)) => {
            let triggered = reading >= max;
            let in_target = reading >= element.target_value && reading < max;
            Some((triggered, in_target))
        }
        _ => None,
    }
}

/// Advance one element's hysteresis track given this tick's reading (or its
/// absence).
pub fn transition(
    prev: HysteresisTrack,
    reading: Option<f64>,
    element: &Element,
) -> HysteresisTrack {
    let Some(reading) = reading else {
        return HysteresisTrack::Unknown;
    };
    let Some((triggered, in_target)) = thresholds(element, reading) else {
        return HysteresisTrack::Unknown;
    };

    match prev {
        HysteresisTrack::Unknown | HysteresisTrack::Below => {
            if triggered {
                HysteresisTrack::Latched
            } else {
                HysteresisTrack::Below
            }
        }
        HysteresisTrack::Latched => {
            if in_target {
                HysteresisTrack::Latched
            } else {
                HysteresisTrack::Below
            }
        }
    }
}

/// Combine per-element tracks under the rule's logic type. Zero elements
/// always passes. `and` requires every track latched
/// (any unknown or below-trigger element fails it). `or` passes if any
/// track is latched; unknown elements are simply not-latched and do not
/// short-circuit the whole rule to failure unless every element is unknown
/// (in which case none is latched either, so it fails naturally).
pub fn combine(tracks: &[HysteresisTrack], logic: LogicType) -> bool {
    if tracks.is_empty() {
        return true;
    }
    match logic {
        LogicType::And => tracks.iter().all(|t| *t == HysteresisTrack::Latched),
        LogicType::Or => tracks.iter().any(|t| *t == HysteresisTrack::Latched),
    }
}

/// Total overlap, in seconds, between `activations` (open ones treated as
/// ending at `now`) and the trailing window `[now - every, now]`.
pub fn trailing_overlap_seconds<'a>(
    activations: impl Iterator<Item = &'a Activation>,
    now: OffsetDateTime,
    every_seconds: i64,
) -> i64 {
    let window_start = now - Duration::seconds(every_seconds);
    let mut total = 0i64;

    for activation in activations {
        let start = activation.start_time;
        let end = activation.end_time.unwrap_or(now);
        let overlap_start = start.max(window_start);
        let overlap_end = end.min(now);
        if overlap_end > overlap_start {
            total += (overlap_end - overlap_start).whole_seconds();
        }
    }

    total
}

impl RuleLimit {
    /// True if this rule has already spent `>= period` seconds active
    /// within the trailing `every`-second window, counting `activations`
    /// that belong to this limit's rule.
    pub fn exceeded<'a>(
        &self,
        activations: impl Iterator<Item = &'a Activation>,
        now: OffsetDateTime,
    ) -> bool {
        trailing_overlap_seconds(activations, now, self.every) >= self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActivationOwner;
    use time::macros::datetime;
    use uuid::Uuid;

    fn max_element(max: f64, target: f64) -> Element {
        Element {
            uuid: Uuid::new_v4(),
            rule_uuid: Uuid::new_v4(),
            sensor_uuid: Uuid::new_v4(),
            min_value: None,
            max_value: Some(max),
            target_value: target,
        }
    }

    fn min_element(min: f64, target: f64) -> Element {
        Element {
            uuid: Uuid::new_v4(),
            rule_uuid: Uuid::new_v4(),
            sensor_uuid: Uuid::new_v4(),
            min_value: Some(min),
            max_value: None,
            target_value: target,
        }
    }

    #[test]
    fn hysteresis_walks_through_documented_reading_stream() {
        // Element max=30, target=25. Readings: 20, 31, 28, 24, 26 -> 0,1,1,0,0
        let element = max_element(30.0, 25.0);
        let mut track = HysteresisTrack::Unknown;
        let expected = [
            HysteresisTrack::Below,
            HysteresisTrack::Latched,
            HysteresisTrack::Latched,
            HysteresisTrack::Below,
            HysteresisTrack::Below,
        ];
        for (reading, want) in [20.0, 31.0, 28.0, 24.0, 26.0].into_iter().zip(expected) {
            track = transition(track, Some(reading), &element);
            assert_eq!(track, want, "reading {reading}");
        }
    }

    #[test]
    fn missing_reading_resets_to_unknown() {
        let element = max_element(30.0, 25.0);
        let track = transition(HysteresisTrack::Latched, None, &element);
        assert_eq!(track, HysteresisTrack::Unknown);
    }

    #[test]
    fn misconfigured_element_is_unknown() {
        let bad = Element {
            uuid: Uuid::new_v4(),
            rule_uuid: Uuid::new_v4(),
            sensor_uuid: Uuid::new_v4(),
            min_value: None,
            max_value: None,
            target_value: 1.0,
        };
        assert_eq!(
            transition(HysteresisTrack::Below, Some(5.0), &bad),
            HysteresisTrack::Unknown
        );
    }

    #[test]
    fn max_equals_target_means_in_target_interval_is_empty() {
        // max=target=30: oscillates between 0 and 1 on every sample above max.
        let element = max_element(30.0, 30.0);
        let mut track = HysteresisTrack::Latched;
        track = transition(track, Some(31.0), &element);
        assert_eq!(track, HysteresisTrack::Latched);
        track = transition(track, Some(31.0), &element);
        // in_target requires r < max, 31 is not < 30, so it releases.
        assert_eq!(track, HysteresisTrack::Below);
    }

    #[test]
    fn min_value_element_triggers_below_and_releases_above_target() {
        let element = min_element(10.0, 15.0);
        let mut track = HysteresisTrack::Unknown;
        track = transition(track, Some(8.0), &element); // triggered
        assert_eq!(track, HysteresisTrack::Latched);
        track = transition(track, Some(12.0), &element); // in target (10<12<=15)
        assert_eq!(track, HysteresisTrack::Latched);
        track = transition(track, Some(16.0), &element); // above target, releases
        assert_eq!(track, HysteresisTrack::Below);
    }

    #[test]
    fn and_fails_on_any_unknown_or_unlatched() {
        let tracks = [HysteresisTrack::Latched, HysteresisTrack::Unknown];
        assert!(!combine(&tracks, LogicType::And));
        let tracks = [HysteresisTrack::Latched, HysteresisTrack::Latched];
        assert!(combine(&tracks, LogicType::And));
    }

    #[test]
    fn or_tolerates_unknown_unless_all_unknown() {
        let tracks = [HysteresisTrack::Latched, HysteresisTrack::Unknown];
        assert!(combine(&tracks, LogicType::Or));
        let tracks = [HysteresisTrack::Unknown, HysteresisTrack::Unknown];
        assert!(!combine(&tracks, LogicType::Or));
    }

    #[test]
    fn zero_elements_always_passes() {
        assert!(combine(&[], LogicType::And));
        assert!(combine(&[], LogicType::Or));
    }

    fn activation(rule: Uuid, start: OffsetDateTime, end: Option<OffsetDateTime>) -> Activation {
        Activation {
            uuid: Uuid::new_v4(),
            owner: ActivationOwner::Rule(rule),
            start_time: start,
            end_time: end,
            last_update: end.unwrap_or(start),
        }
    }

    #[test]
    fn rule_limit_every_equals_period_caps_continuous_activity() {
        let rule = Uuid::new_v4();
        let limit = RuleLimit {
            uuid: Uuid::new_v4(),
            rule_uuid: rule,
            every: 3600,
            period: 3600,
        };
        let now = datetime!(2026 - 01 - 01 12:00:00 UTC);
        // Continuously active for the entire trailing hour.
        let acts = vec![activation(rule, now - Duration::hours(1), None)];
        assert!(limit.exceeded(acts.iter(), now));
    }

    #[test]
    fn rule_limit_breach_after_cumulative_threshold() {
        let rule = Uuid::new_v4();
        let limit = RuleLimit {
            uuid: Uuid::new_v4(),
            rule_uuid: rule,
            every: 3600,
            period: 600,
        };
        let now = datetime!(2026 - 01 - 01 12:00:00 UTC);
        let acts = vec![
            activation(
                rule,
                now - Duration::minutes(50),
                Some(now - Duration::minutes(45)),
            ),
            activation(
                rule,
                now - Duration::minutes(20),
                Some(now - Duration::minutes(15)),
            ),
            activation(rule, now - Duration::minutes(4), None),
        ];
        // 5 + 5 + 4 = 14 minutes, under 10 minutes? recompute precisely below.
        let total = trailing_overlap_seconds(acts.iter(), now, 3600);
        assert_eq!(total, 14 * 60);
        assert!(!limit.exceeded(acts.iter(), now));

        let acts2 = vec![activation(rule, now - Duration::minutes(10), None)];
        assert!(limit.exceeded(acts2.iter(), now));
    }
}
