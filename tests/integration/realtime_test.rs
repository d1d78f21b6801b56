use crate::common::{endpoint, factorial_deck, seed_session, test_state};
use classcode_backend::{
    error::AppError,
    models::events::{ClientEvent, ServerEvent},
    services::engine::SessionEngine,
    services::registry::Role,
    services::scheduler::SummaryScheduler,
};
use std::time::Duration;

const CODE: &str = "abcdef";

fn join(name: &str) -> ClientEvent {
    ClientEvent::JoinSession { code: CODE.to_string(), name: name.to_string() }
}

fn teacher_join(name: &str) -> ClientEvent {
    ClientEvent::TeacherJoin { code: CODE.to_string(), name: name.to_string() }
}

fn code_update(source: &str) -> ClientEvent {
    ClientEvent::CodeUpdate { code: source.to_string() }
}

#[tokio::test]
async fn basic_join_delivers_session_data_and_slide() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, CODE, Vec::new()).await;

    let mut teacher = endpoint();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, teacher_join("Ms. T"))
        .await
        .unwrap();
    assert!(matches!(teacher.next_event(), ServerEvent::SessionData { reconnect_token: None, .. }));

    let mut alice = endpoint();
    SessionEngine::dispatch(&state, alice.id, &alice.tx, join("Alice"))
        .await
        .unwrap();

    // Exactly one session-data carrying the token, then one slide-change.
    match alice.next_event() {
        ServerEvent::SessionData { session, reconnect_token } => {
            assert!(session.students.contains_key("Alice"));
            let token = reconnect_token.expect("students receive a token");
            assert_eq!(token.len(), 32);
        }
        other => panic!("expected session-data, got {:?}", other),
    }
    match alice.next_event() {
        ServerEvent::SlideChange { index, has_code_editor, prompt, .. } => {
            assert_eq!(index, 0);
            assert!(!has_code_editor);
            assert_eq!(prompt, "");
        }
        other => panic!("expected slide-change, got {:?}", other),
    }
    alice.assert_empty();

    // The teacher saw the arrival; the store and registry both know Alice.
    assert!(matches!(teacher.next_event(), ServerEvent::UserJoined { .. }));
    assert!(state.store.get(CODE).await.unwrap().students.contains_key("Alice"));
    assert_eq!(state.registry.role_count(CODE, Role::Student).await, 1);
}

#[tokio::test]
async fn join_rejects_unknown_and_inactive_sessions() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, CODE, Vec::new()).await;

    let mut ghost = endpoint();
    let err = SessionEngine::dispatch(
        &state,
        ghost.id,
        &ghost.tx,
        ClientEvent::JoinSession { code: "zzzzzz".to_string(), name: "Alice".to_string() },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = SessionEngine::dispatch(
        &state,
        ghost.id,
        &ghost.tx,
        ClientEvent::JoinSession { code: "ABC123".to_string(), name: "Alice".to_string() },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    SessionEngine::end_session(&state, CODE).await.unwrap();
    let err = SessionEngine::dispatch(&state, ghost.id, &ghost.tx, join("Alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
    ghost.assert_empty();
}

#[tokio::test]
async fn short_code_update_fans_out_without_evaluation() {
    let (state, evaluator) = test_state(|_| {});
    seed_session(&state, CODE, Vec::new()).await;

    let mut teacher = endpoint();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, teacher_join("Ms. T")).await.unwrap();
    let mut alice = endpoint();
    SessionEngine::dispatch(&state, alice.id, &alice.tx, join("Alice")).await.unwrap();
    let mut bob = endpoint();
    SessionEngine::dispatch(&state, bob.id, &bob.tx, join("Bob")).await.unwrap();

    // Drain the join chatter.
    while teacher.rx.try_recv().is_ok() {}
    while alice.rx.try_recv().is_ok() {}
    while bob.rx.try_recv().is_ok() {}

    // "print(1)" is 8 chars: below the evaluation threshold.
    SessionEngine::dispatch(&state, alice.id, &alice.tx, code_update("print(1)"))
        .await
        .unwrap();

    match teacher.next_event() {
        ServerEvent::StudentCodeUpdate { student_name, code, .. } => {
            assert_eq!(student_name, "Alice");
            assert_eq!(code, "print(1)");
        }
        other => panic!("expected student-code-update, got {:?}", other),
    }
    teacher.assert_empty();
    alice.assert_empty();
    bob.assert_empty();

    assert_eq!(evaluator.call_count(), 0);
    assert_eq!(state.store.get(CODE).await.unwrap().students["Alice"].code, "print(1)");
}

#[tokio::test]
async fn long_code_update_triggers_one_rate_limited_evaluation() {
    let (state, evaluator) = test_state(|_| {});
    seed_session(&state, CODE, factorial_deck()).await;

    let mut teacher = endpoint();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, teacher_join("Ms. T")).await.unwrap();
    let mut alice = endpoint();
    SessionEngine::dispatch(&state, alice.id, &alice.tx, join("Alice")).await.unwrap();
    while teacher.rx.try_recv().is_ok() {}

    let draft = "def f(n):\n return n*2\nprint(f(3))";
    SessionEngine::dispatch(&state, alice.id, &alice.tx, code_update(draft)).await.unwrap();

    let summary = teacher
        .wait_for(
            |e| matches!(e, ServerEvent::StudentSummaryUpdate { .. }),
            Duration::from_secs(1),
        )
        .await
        .expect("teachers receive the summary");
    match summary {
        ServerEvent::StudentSummaryUpdate { student_name, summary, .. } => {
            assert_eq!(student_name, "Alice");
            assert!(!summary.feedback.is_empty());
        }
        _ => unreachable!(),
    }
    assert_eq!(evaluator.call_count(), 1);

    // A second update moments later updates the draft but is gated away
    // from the evaluator.
    SessionEngine::dispatch(&state, alice.id, &alice.tx, code_update("def f(n):\n return n*3"))
        .await
        .unwrap();
    let extra_summary = teacher
        .wait_for(
            |e| matches!(e, ServerEvent::StudentSummaryUpdate { .. }),
            Duration::from_millis(200),
        )
        .await;
    assert!(extra_summary.is_none());
    assert_eq!(evaluator.call_count(), 1);

    // The summary landed on the student record.
    let doc = state.store.get(CODE).await.unwrap();
    assert!(doc.students["Alice"].summary.is_some());
}

#[tokio::test]
async fn teacher_code_update_is_silent() {
    let (state, evaluator) = test_state(|_| {});
    seed_session(&state, CODE, Vec::new()).await;

    let mut teacher = endpoint();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, teacher_join("Ms. T")).await.unwrap();
    let mut alice = endpoint();
    SessionEngine::dispatch(&state, alice.id, &alice.tx, join("Alice")).await.unwrap();
    while teacher.rx.try_recv().is_ok() {}
    while alice.rx.try_recv().is_ok() {}

    SessionEngine::dispatch(
        &state,
        teacher.id,
        &teacher.tx,
        code_update("// scratchpad notes, long enough to evaluate"),
    )
    .await
    .unwrap();

    teacher.assert_empty();
    alice.assert_empty();
    assert_eq!(evaluator.call_count(), 0);
    assert!(state
        .store
        .get(CODE)
        .await
        .unwrap()
        .current_code
        .contains("scratchpad"));
}

#[tokio::test]
async fn slide_navigation_broadcasts_to_the_room() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, CODE, factorial_deck()).await;

    let mut teacher = endpoint();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, teacher_join("Ms. T")).await.unwrap();
    let mut alice = endpoint();
    SessionEngine::dispatch(&state, alice.id, &alice.tx, join("Alice")).await.unwrap();
    while teacher.rx.try_recv().is_ok() {}
    while alice.rx.try_recv().is_ok() {}

    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, ClientEvent::UpdateSlide { slide_index: 2 })
        .await
        .unwrap();

    for endpoint in [&mut teacher, &mut alice] {
        match endpoint.next_event() {
            ServerEvent::SlideChange { index, has_code_editor, prompt, .. } => {
                assert_eq!(index, 2);
                assert!(has_code_editor);
                assert_eq!(prompt, "Write a factorial");
            }
            other => panic!("expected slide-change, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn slide_navigation_is_teacher_only_and_validated() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, CODE, factorial_deck()).await;

    let mut teacher = endpoint();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, teacher_join("Ms. T")).await.unwrap();
    let mut alice = endpoint();
    SessionEngine::dispatch(&state, alice.id, &alice.tx, join("Alice")).await.unwrap();

    let err = SessionEngine::dispatch(&state, alice.id, &alice.tx, ClientEvent::UpdateSlide { slide_index: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let err = SessionEngine::dispatch(&state, teacher.id, &teacher.tx, ClientEvent::UpdateSlide { slide_index: 9 })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = SessionEngine::dispatch(&state, teacher.id, &teacher.tx, ClientEvent::UpdateSlide { slide_index: -1 })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // The failed attempts left the document on slide 0.
    assert_eq!(state.store.get(CODE).await.unwrap().current_slide, 0);
}

#[tokio::test]
async fn repeated_update_slide_is_idempotent() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, CODE, factorial_deck()).await;

    let mut teacher = endpoint();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, teacher_join("Ms. T")).await.unwrap();
    while teacher.rx.try_recv().is_ok() {}

    let strip_updated_at = |doc: &classcode_backend::models::session::Session| {
        let mut value = serde_json::to_value(doc).unwrap();
        value.as_object_mut().unwrap().remove("updatedAt");
        value
    };

    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, ClientEvent::UpdateSlide { slide_index: 2 })
        .await
        .unwrap();
    let first_doc = strip_updated_at(&state.store.get(CODE).await.unwrap());
    let first_event = teacher.next_event();

    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, ClientEvent::UpdateSlide { slide_index: 2 })
        .await
        .unwrap();
    let second_doc = strip_updated_at(&state.store.get(CODE).await.unwrap());
    let second_event = teacher.next_event();

    assert_eq!(first_doc, second_doc);
    match (first_event, second_event) {
        (
            ServerEvent::SlideChange { index: i1, has_code_editor: h1, prompt: p1, .. },
            ServerEvent::SlideChange { index: i2, has_code_editor: h2, prompt: p2, .. },
        ) => {
            assert_eq!((i1, h1, &p1), (i2, h2, &p2));
        }
        other => panic!("expected two slide-change events, got {:?}", other),
    }
}

#[tokio::test]
async fn update_slide_data_replaces_deck_and_clamps() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, CODE, factorial_deck()).await;

    let mut teacher = endpoint();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, teacher_join("Ms. T")).await.unwrap();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, ClientEvent::UpdateSlide { slide_index: 2 })
        .await
        .unwrap();

    SessionEngine::dispatch(
        &state,
        teacher.id,
        &teacher.tx,
        ClientEvent::UpdateSlideData {
            slides: vec![classcode_backend::models::session::Slide {
                prompt: "New single slide".to_string(),
                has_coding_task: true,
            }],
            slides_with_code: vec![0],
        },
    )
    .await
    .unwrap();

    let doc = state.store.get(CODE).await.unwrap();
    assert_eq!(doc.slides.len(), 1);
    assert_eq!(doc.current_slide, 0);
    assert_eq!(doc.slides_with_code, vec![0]);
}

#[tokio::test]
async fn execute_code_replies_to_caller_and_teachers() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, CODE, Vec::new()).await;

    let mut teacher = endpoint();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, teacher_join("Ms. T")).await.unwrap();
    let mut alice = endpoint();
    SessionEngine::dispatch(&state, alice.id, &alice.tx, join("Alice")).await.unwrap();
    while teacher.rx.try_recv().is_ok() {}
    while alice.rx.try_recv().is_ok() {}

    // An unsupported language is recovered into the result payload, so
    // this path needs no interpreter on the test host.
    SessionEngine::dispatch(
        &state,
        alice.id,
        &alice.tx,
        ClientEvent::ExecuteCode { code: "puts 1".to_string(), language: "ruby".to_string() },
    )
    .await
    .unwrap();

    match alice.next_event() {
        ServerEvent::ExecutionResult { result, error, .. } => {
            assert!(result.starts_with("Error:"));
            assert!(error.is_some());
        }
        other => panic!("expected execution-result, got {:?}", other),
    }
    alice.assert_empty();

    match teacher.next_event() {
        ServerEvent::StudentExecutionResult { student_name, error, .. } => {
            assert_eq!(student_name, "Alice");
            assert!(error.is_some());
        }
        other => panic!("expected student-execution-result, got {:?}", other),
    }

    let doc = state.store.get(CODE).await.unwrap();
    let execution = doc.students["Alice"].last_execution.as_ref().expect("persisted");
    assert!(execution.error.is_some());
}

#[tokio::test]
async fn grace_reconnect_restores_the_draft() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, CODE, factorial_deck()).await;

    let mut alice = endpoint();
    SessionEngine::dispatch(&state, alice.id, &alice.tx, join("Alice")).await.unwrap();
    let token = match alice.next_event() {
        ServerEvent::SessionData { reconnect_token: Some(token), .. } => token,
        other => panic!("expected session-data, got {:?}", other),
    };
    SessionEngine::dispatch(&state, alice.id, &alice.tx, code_update("print(1)")).await.unwrap();

    SessionEngine::handle_disconnect(&state, alice.id).await;
    let doc = state.store.get(CODE).await.unwrap();
    assert!(doc.students["Alice"].disconnected_at.is_some());
    assert_eq!(state.registry.role_count(CODE, Role::Student).await, 0);

    // Reconnect with the issued token from a fresh endpoint.
    let mut alice2 = endpoint();
    SessionEngine::dispatch(
        &state,
        alice2.id,
        &alice2.tx,
        ClientEvent::ReconnectSession {
            code: CODE.to_string(),
            name: "Alice".to_string(),
            token: token.clone(),
        },
    )
    .await
    .unwrap();

    assert!(matches!(alice2.next_event(), ServerEvent::SessionData { .. }));
    assert!(matches!(alice2.next_event(), ServerEvent::SlideChange { .. }));
    match alice2.next_event() {
        ServerEvent::CodeRestore { code, .. } => assert_eq!(code, "print(1)"),
        other => panic!("expected code-restore, got {:?}", other),
    }

    let doc = state.store.get(CODE).await.unwrap();
    assert!(doc.students["Alice"].disconnected_at.is_none());
    assert!(doc.students["Alice"].reconnected_at.is_some());

    // A wrong token is refused.
    let mut mallory = endpoint();
    let err = SessionEngine::dispatch(
        &state,
        mallory.id,
        &mallory.tx,
        ClientEvent::ReconnectSession {
            code: CODE.to_string(),
            name: "Alice".to_string(),
            token: "0".repeat(32),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn expired_grace_removes_the_student() {
    let (state, _) = test_state(|config| {
        config.session.disconnect_grace_seconds = 0;
    });
    seed_session(&state, CODE, Vec::new()).await;

    let mut alice = endpoint();
    SessionEngine::dispatch(&state, alice.id, &alice.tx, join("Alice")).await.unwrap();
    let token = match alice.next_event() {
        ServerEvent::SessionData { reconnect_token: Some(token), .. } => token,
        other => panic!("expected session-data, got {:?}", other),
    };

    SessionEngine::handle_disconnect(&state, alice.id).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!state.store.get(CODE).await.unwrap().students.contains_key("Alice"));

    // Reconnect after the window fails: the record is gone.
    let mut alice2 = endpoint();
    let err = SessionEngine::dispatch(
        &state,
        alice2.id,
        &alice2.tx,
        ClientEvent::ReconnectSession {
            code: CODE.to_string(),
            name: "Alice".to_string(),
            token,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn rejoin_within_grace_replaces_the_record() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, CODE, Vec::new()).await;

    let mut alice = endpoint();
    SessionEngine::dispatch(&state, alice.id, &alice.tx, join("Alice")).await.unwrap();
    let first_token = match alice.next_event() {
        ServerEvent::SessionData { reconnect_token: Some(token), .. } => token,
        other => panic!("expected session-data, got {:?}", other),
    };
    SessionEngine::dispatch(&state, alice.id, &alice.tx, code_update("print(1)")).await.unwrap();
    SessionEngine::handle_disconnect(&state, alice.id).await;

    // A fresh join under the same name overwrites the record: new token,
    // empty draft, old token dead.
    let mut alice2 = endpoint();
    SessionEngine::dispatch(&state, alice2.id, &alice2.tx, join("Alice")).await.unwrap();
    let second_token = match alice2.next_event() {
        ServerEvent::SessionData { reconnect_token: Some(token), .. } => token,
        other => panic!("expected session-data, got {:?}", other),
    };
    assert_ne!(first_token, second_token);
    assert_eq!(state.store.get(CODE).await.unwrap().students["Alice"].code, "");
}

#[tokio::test]
async fn disconnecting_last_teacher_stops_the_scheduler() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, CODE, Vec::new()).await;

    let mut teacher = endpoint();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, teacher_join("Ms. T")).await.unwrap();
    assert!(state.schedulers.lock().await.contains_key(CODE));

    SessionEngine::handle_disconnect(&state, teacher.id).await;
    assert!(!state.schedulers.lock().await.contains_key(CODE));
}

#[tokio::test]
async fn scheduler_sweeps_active_drafts_to_teachers() {
    let (state, evaluator) = test_state(|config| {
        config.session.summary_interval_seconds = 1;
    });
    seed_session(&state, CODE, factorial_deck()).await;

    let mut teacher = endpoint();
    SessionEngine::dispatch(&state, teacher.id, &teacher.tx, teacher_join("Ms. T")).await.unwrap();
    let mut alice = endpoint();
    SessionEngine::dispatch(&state, alice.id, &alice.tx, join("Alice")).await.unwrap();
    while teacher.rx.try_recv().is_ok() {}

    // Seed the draft directly so the code-update path's own evaluation
    // does not consume the rate-limit slot.
    state
        .store
        .update(CODE, |doc| {
            if let Some(st) = doc.students.get_mut("Alice") {
                st.code = "def f(n):\n return n*2".to_string();
            }
        })
        .await
        .unwrap();

    let summary = teacher
        .wait_for(
            |e| matches!(e, ServerEvent::StudentSummaryUpdate { .. }),
            Duration::from_secs(3),
        )
        .await
        .expect("scheduler delivers a summary to the teacher");
    assert!(matches!(summary, ServerEvent::StudentSummaryUpdate { .. }));
    assert!(evaluator.call_count() >= 1);

    SummaryScheduler::stop(&state, CODE).await;
}

#[tokio::test]
async fn code_update_requires_a_joined_endpoint() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, CODE, Vec::new()).await;

    let mut stranger = endpoint();
    let err = SessionEngine::dispatch(&state, stranger.id, &stranger.tx, code_update("print(1)"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}
