//! Property-based tests for tradeqr-core
//!
//! These tests verify correctness properties using proptest.

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    use crate::code::{encode, normalize_code, CODE_BYTES, CODE_LENGTH};
    use crate::types::{
        CreateSessionRequest, DomainParams, Session, SessionState, FAIRNESS_THRESHOLD_RANGE,
    };

    fn any_state() -> impl Strategy<Value = SessionState> {
        prop_oneof![
            Just(SessionState::Waiting),
            Just(SessionState::Connected),
            Just(SessionState::Proposing),
            Just(SessionState::Completed),
            Just(SessionState::Cancelled),
            Just(SessionState::Expired),
        ]
    }

    // Every generated code is already canonical, and survives the ways a
    // person retypes it: lower case, dashes between groups, stray spaces.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn test_code_survives_transcription(
            bytes in any::<[u8; CODE_BYTES]>(),
            group in 1usize..8,
            lower in any::<bool>(),
        ) {
            let code = encode(&bytes);
            prop_assert_eq!(code.len(), CODE_LENGTH);
            prop_assert_eq!(normalize_code(&code), Some(code.clone()));

            let typed: String = code
                .chars()
                .enumerate()
                .flat_map(|(i, c)| {
                    let sep = (i > 0 && i % group == 0).then_some('-');
                    sep.into_iter().chain(std::iter::once(c))
                })
                .map(|c| if lower { c.to_ascii_lowercase() } else { c })
                .collect();
            prop_assert_eq!(normalize_code(&format!(" {} ", typed)), Some(code));
        }

        #[test]
        fn test_normalize_is_idempotent(input in "[ -~]{0,24}") {
            if let Some(code) = normalize_code(&input) {
                prop_assert_eq!(normalize_code(&code), Some(code.clone()));
                prop_assert_eq!(code.len(), CODE_LENGTH);
            }
        }
    }

    // Fairness threshold is accepted exactly on the closed range.
    proptest! {
        #[test]
        fn test_fairness_threshold_bounds(threshold in -20.0f64..30.0) {
            let request = CreateSessionRequest {
                fairness_threshold: Some(threshold),
                ..Default::default()
            };
            let accepted = request.into_params().is_ok();
            prop_assert_eq!(accepted, FAIRNESS_THRESHOLD_RANGE.contains(&threshold));
        }
    }

    // A session past its deadline is never observed as Waiting, and a
    // session inside its window is never observed as Expired.
    proptest! {
        #[test]
        fn test_effective_state_respects_deadline(
            start in 1_700_000_000_000i64..1_900_000_000_000i64,
            offset_ms in -300_000i64..300_000,
            state in any_state(),
        ) {
            let now = Utc.timestamp_millis_opt(start).single().unwrap();
            let mut session = Session::new(
                "alice",
                "ABCDEFGHJKMNPQRS".to_string(),
                DomainParams::default(),
                now,
                Duration::seconds(120),
            );
            session.state = state;

            let at = session.expires_at + Duration::milliseconds(offset_ms);
            let observed = session.effective_state(at);

            if offset_ms > 0 && state == SessionState::Waiting {
                prop_assert_eq!(observed, SessionState::Expired);
            } else {
                prop_assert_eq!(observed, state);
            }
        }

        #[test]
        fn test_terminal_states_have_no_exits(from in any_state(), to in any_state()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
            if from.can_transition_to(to) {
                prop_assert_ne!(to, SessionState::Waiting);
            }
        }
    }
}
