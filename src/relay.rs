//! Relay controller: manual override precedence, safety debounce, and the
//! decision of whether/what to transmit to the board this tick.
//!
//! Split into two pure steps that mirror the tick pipeline's own two relay
//! stages: `apply_manual_force` runs during
//! `calculate_forced_relays`, `contact` runs during `contact_relays` once
//! rule consequences have produced this tick's signal map. Activation
//! persistence and the actual serial transmit are side effects the tick
//! loop (`garden.rs`) performs around these calls.

use std::time::{Duration, Instant};

use crate::models::Relay;

pub const DEFAULT_SAFETY_SECONDS: u64 = 10;

/// What activation bookkeeping the caller must perform after
/// `apply_manual_force`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForceOutcome {
    pub open_activation: bool,
    pub close_activation: bool,
}

/// Resolve manual-override precedence for one relay ahead of rule
/// evaluation. Pins `forced`/`current_state` when `manual` is set on a
/// connected slave; otherwise clears `forced` and signals that any
/// manual-owned activation should close.
pub fn apply_manual_force(relay: &mut Relay, slave_connected: bool) -> ForceOutcome {
    if !relay.active {
        return ForceOutcome::default();
    }

    if relay.manual && slave_connected {
        relay.forced = true;
        relay.current_state = true;
        ForceOutcome {
            open_activation: relay.current_activation.is_none(),
            close_activation: false,
        }
    } else {
        relay.forced = false;
        ForceOutcome {
            open_activation: false,
            close_activation: relay.current_activation.is_some(),
        }
    }
}

/// Resolve this tick's transmit decision given the rule-consequence signal
/// map (if any entry exists for this relay), applying the safety debounce.
/// Returns the state to transmit, or `None` if nothing should be sent.
pub fn contact(
    relay: &mut Relay,
    desired_signal: Option<bool>,
    now: Instant,
    safety_seconds: u64,
) -> Option<bool> {
    if !relay.active {
        return None;
    }

    if relay.forced {
        return Some(relay.current_state);
    }

    let signal = desired_signal?;
    if signal == relay.current_state {
        return Some(signal);
    }

    let can_toggle = match relay.last_toggle {
        None => true,
        Some(last) => now.duration_since(last) >= Duration::from_secs(safety_seconds),
    };
    if can_toggle {
        relay.current_state = signal;
        relay.last_toggle = Some(now);
    }
    Some(relay.current_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SlaveId;
    use uuid::Uuid;

    fn relay() -> Relay {
        Relay::new(Uuid::new_v4(), SlaveId::new("s".repeat(36)).unwrap(), true, false, 3)
    }

    #[test]
    fn inactive_relay_is_skipped_entirely() {
        let mut r = relay();
        r.active = false;
        assert_eq!(apply_manual_force(&mut r, true), ForceOutcome::default());
        assert_eq!(contact(&mut r, Some(true), Instant::now(), 10), None);
    }

    #[test]
    fn manual_override_forces_on_and_opens_activation_once() {
        let mut r = relay();
        r.manual = true;
        let outcome = apply_manual_force(&mut r, true);
        assert!(r.forced);
        assert!(r.current_state);
        assert!(outcome.open_activation);

        r.current_activation = Some(Uuid::new_v4());
        let outcome2 = apply_manual_force(&mut r, true);
        assert!(!outcome2.open_activation, "activation should not reopen");

        assert_eq!(contact(&mut r, None, Instant::now(), 10), Some(true));
    }

    #[test]
    fn unsetting_manual_closes_activation() {
        let mut r = relay();
        r.manual = true;
        r.forced = true;
        r.current_state = true;
        r.current_activation = Some(Uuid::new_v4());
        r.manual = false;

        let outcome = apply_manual_force(&mut r, true);
        assert!(!r.forced);
        assert!(outcome.close_activation);
    }

    #[test]
    fn disconnected_slave_cannot_be_forced() {
        let mut r = relay();
        r.manual = true;
        let outcome = apply_manual_force(&mut r, false);
        assert!(!r.forced);
        assert!(!outcome.open_activation);
    }

    #[test]
    fn safety_debounce_denies_toggle_inside_window_and_accepts_after() {
        let mut r = relay();
        let t0 = Instant::now();

        let transmit0 = contact(&mut r, Some(true), t0, 10);
        assert_eq!(transmit0, Some(true));
        assert!(r.current_state);
        let toggle_at = r.last_toggle.unwrap();

        let t1 = t0 + Duration::from_secs(5);
        let transmit1 = contact(&mut r, Some(false), t1, 10);
        assert!(r.current_state, "denied toggle leaves state unchanged");
        assert_eq!(transmit1, Some(true));
        assert_eq!(r.last_toggle, Some(toggle_at));

        let t2 = t0 + Duration::from_secs(11);
        let transmit2 = contact(&mut r, Some(false), t2, 10);
        assert!(!r.current_state);
        assert_eq!(transmit2, Some(false));
        assert_eq!(r.last_toggle, Some(t2));
    }

    #[test]
    fn no_signal_and_not_forced_means_no_transmit() {
        let mut r = relay();
        assert_eq!(contact(&mut r, None, Instant::now(), 10), None);
    }

    #[test]
    fn matching_signal_is_always_accepted_without_touching_last_toggle() {
        let mut r = relay();
        r.current_state = true;
        let transmit = contact(&mut r, Some(true), Instant::now(), 10);
        assert_eq!(transmit, Some(true));
        assert!(r.last_toggle.is_none());
    }
}
