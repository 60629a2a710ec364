//! Property tests for the client-side room mirror.
//!
//! - Echo suppression: own fan-out never changes the buffer
//! - Snapshot application is idempotent
//! - Language selection always lands on the template
//! - Presence operations are idempotent

use proptest::prelude::*;

use common_coding_room::language::Language;
use common_coding_room::protocol::Snapshot;
use common_coding_room::state::RoomSessionState;

const LOCAL: &str = "alice";

fn any_language() -> impl Strategy<Value = Language> {
    prop::sample::select(Language::ALL.to_vec())
}

fn any_username() -> impl Strategy<Value = String> {
    "[a-z]{1,8}"
}

fn any_snapshot() -> impl Strategy<Value = Snapshot> {
    (
        prop::option::of(".{0,40}"),
        prop::option::of(any_language()),
        prop::option::of(prop::collection::vec(any_username(), 0..6)),
    )
        .prop_map(|(code, language, participants)| Snapshot { code, language, participants })
}

fn fresh() -> RoomSessionState {
    RoomSessionState::new("ab12cd34", LOCAL)
}

proptest! {
    #[test]
    fn prop_own_code_echo_is_ignored(
        start in ".{0,40}",
        echoes in prop::collection::vec(".{0,40}", 1..10),
    ) {
        let mut s = fresh();
        s.request_local_code_change(start.clone());
        for code in echoes {
            prop_assert!(!s.apply_remote_code_update(LOCAL, code));
        }
        prop_assert_eq!(s.code(), start.as_str());
    }

    #[test]
    fn prop_peer_code_update_is_last_write_wins(
        updates in prop::collection::vec((any_username(), ".{0,40}"), 1..10),
    ) {
        let mut s = RoomSessionState::new("ab12cd34", "LOCAL_USER");
        for (sender, code) in &updates {
            s.apply_remote_code_update(sender, code.clone());
        }
        let (_, last) = updates.last().unwrap();
        prop_assert_eq!(s.code(), last.as_str());
    }

    #[test]
    fn prop_initial_state_is_idempotent(
        seed in ".{0,20}",
        snapshot in any_snapshot(),
    ) {
        let mut once = fresh();
        once.request_local_code_change(seed.clone());
        let mut twice = once.clone();

        once.apply_initial_state(&snapshot);
        twice.apply_initial_state(&snapshot);
        twice.apply_initial_state(&snapshot);
        prop_assert_eq!(once.room(), twice.room());
    }

    #[test]
    fn prop_language_change_lands_on_template(
        before in ".{0,40}",
        language in any_language(),
    ) {
        let mut s = fresh();
        s.request_local_code_change(before);
        s.request_local_language_change(language);
        prop_assert_eq!(s.language(), language);
        prop_assert_eq!(s.code(), language.template());
    }

    #[test]
    fn prop_language_sequence_keeps_only_last_template(
        path in prop::collection::vec(any_language(), 1..6),
    ) {
        let mut s = fresh();
        for language in &path {
            s.request_local_language_change(*language);
        }
        let last = *path.last().unwrap();
        prop_assert_eq!(s.code(), last.template());
    }

    #[test]
    fn prop_join_is_idempotent(
        roster in prop::collection::vec(any_username(), 0..6),
        user in any_username(),
    ) {
        let mut s = fresh();
        for u in &roster {
            s.apply_participant_joined(u);
        }
        s.apply_participant_joined(&user);
        let chat_len = s.chat().len();
        prop_assert!(!s.apply_participant_joined(&user));
        prop_assert_eq!(s.participants().iter().filter(|u| *u == user).count(), 1);
        prop_assert_eq!(s.chat().len(), chat_len);
    }

    #[test]
    fn prop_leave_of_absent_user_is_noop(
        roster in prop::collection::vec("[a-m]{1,6}", 0..6),
        absent in "[n-z]{1,6}",
    ) {
        let mut s = fresh();
        for u in &roster {
            s.apply_participant_joined(u);
        }
        let before = s.participants().clone();
        let chat_len = s.chat().len();
        prop_assert!(!s.apply_participant_left(&absent));
        prop_assert_eq!(s.participants(), &before);
        prop_assert_eq!(s.chat().len(), chat_len);
    }
}

#[test]
fn test_python_rust_python_returns_to_python_template() {
    let mut s = fresh();
    s.request_local_code_change("print('work in progress')");
    s.request_local_language_change(Language::Python);
    s.request_local_language_change(Language::Rust);
    s.request_local_language_change(Language::Python);
    assert_eq!(s.code(), Language::Python.template());
}
