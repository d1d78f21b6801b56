use crate::common::{factorial_deck, seed_session, test_state};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use classcode_backend::{
    controllers::session as http,
    error::AppError,
    models::api::{CreateSessionRequest, JoinSessionRequest, UpdateSessionRequest},
    services::code_generator::is_valid_session_code,
};

#[tokio::test]
async fn create_returns_a_fresh_code() {
    let (state, _) = test_state(|_| {});

    let (status, Json(response)) = http::create_session(
        State(state.clone()),
        Json(CreateSessionRequest {
            title: "Recursion 101".to_string(),
            description: "Intro lesson".to_string(),
            language: "python".to_string(),
            initial_code: String::new(),
            slides: factorial_deck(),
        }),
    )
    .await
    .unwrap();

    assert_eq!(status, StatusCode::CREATED);
    assert!(response.success);
    assert!(is_valid_session_code(&response.session_code));

    let doc = state.store.get(&response.session_code).await.unwrap();
    assert_eq!(doc.title, "Recursion 101");
    assert_eq!(doc.slides.len(), 3);
    assert_eq!(doc.slides_with_code, vec![2]);
    assert!(doc.active);
}

#[tokio::test]
async fn create_rejects_blank_title() {
    let (state, _) = test_state(|_| {});
    let err = http::create_session(
        State(state),
        Json(CreateSessionRequest {
            title: "   ".to_string(),
            description: String::new(),
            language: "python".to_string(),
            initial_code: String::new(),
            slides: Vec::new(),
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn get_and_update_round_trip() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, "abcdef", Vec::new()).await;

    let Json(response) = http::get_session(State(state.clone()), Path("abcdef".to_string()))
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.session.code, "abcdef");

    let Json(updated) = http::update_session(
        State(state.clone()),
        Path("abcdef".to_string()),
        Json(UpdateSessionRequest {
            title: Some("Renamed".to_string()),
            description: None,
            language: None,
            initial_code: Some("print('hi')".to_string()),
        }),
    )
    .await
    .unwrap();
    assert_eq!(updated.session.title, "Renamed");
    assert_eq!(updated.session.initial_code, "print('hi')");

    let err = http::get_session(State(state), Path("zzzzzz".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn http_join_issues_a_reconnect_token() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, "abcdef", Vec::new()).await;

    let Json(response) = http::join_session(
        State(state.clone()),
        Path("abcdef".to_string()),
        Json(JoinSessionRequest { name: "Alice".to_string() }),
    )
    .await
    .unwrap();

    assert!(response.success);
    assert_eq!(response.reconnect_token.len(), 32);
    assert!(response.session.students.contains_key("Alice"));
    assert!(state.store.get("abcdef").await.unwrap().students.contains_key("Alice"));
}

#[tokio::test]
async fn end_blocks_further_joins() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, "abcdef", Vec::new()).await;

    let Json(ack) = http::end_session(State(state.clone()), Path("abcdef".to_string()))
        .await
        .unwrap();
    assert!(ack.success);
    assert!(!state.store.get("abcdef").await.unwrap().active);

    let err = http::join_session(
        State(state),
        Path("abcdef".to_string()),
        Json(JoinSessionRequest { name: "Late".to_string() }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn delete_frees_the_session() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, "abcdef", Vec::new()).await;

    let Json(ack) = http::delete_session(State(state.clone()), Path("abcdef".to_string()))
        .await
        .unwrap();
    assert!(ack.success);
    assert!(state.store.get("abcdef").await.is_err());
}

#[tokio::test]
async fn http_slide_navigation_validates_range() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, "abcdef", factorial_deck()).await;

    let Json(ack) = http::set_slide(State(state.clone()), Path(("abcdef".to_string(), 2)))
        .await
        .unwrap();
    assert!(ack.success);
    assert_eq!(state.store.get("abcdef").await.unwrap().current_slide, 2);

    let err = http::set_slide(State(state), Path(("abcdef".to_string(), 9)))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn summaries_list_all_students() {
    let (state, _) = test_state(|_| {});
    seed_session(&state, "abcdef", Vec::new()).await;

    for name in ["Alice", "Bob"] {
        http::join_session(
            State(state.clone()),
            Path("abcdef".to_string()),
            Json(JoinSessionRequest { name: name.to_string() }),
        )
        .await
        .unwrap();
    }

    let Json(response) = http::list_summaries(State(state.clone()), Path("abcdef".to_string()))
        .await
        .unwrap();
    assert_eq!(response.summaries.len(), 2);
    assert_eq!(response.summaries[0].student_name, "Alice");
    assert!(response.summaries[0].summary.is_none());

    let Json(single) = http::get_student_summary(
        State(state.clone()),
        Path(("abcdef".to_string(), "Bob".to_string())),
    )
    .await
    .unwrap();
    assert!(single.success);
    assert!(single.summary.is_none());

    let err = http::get_student_summary(
        State(state),
        Path(("abcdef".to_string(), "Nobody".to_string())),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}
