use crate::controllers::{health, session, websocket};
use crate::middleware::create_cors_layer;
use crate::state::AppState;
use axum::{
    routing::{get, post, put},
    Router,
};

pub fn create_router(state: AppState) -> Router {
    let cors = create_cors_layer(&state.config.cors);
    let ws_path = state.config.server.ws_path.clone();

    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/session/create", post(session::create_session))
        .route(
            "/api/session/:code",
            get(session::get_session)
                .put(session::update_session)
                .delete(session::delete_session),
        )
        .route("/api/session/:code/join", post(session::join_session))
        .route("/api/session/:code/end", put(session::end_session))
        .route("/api/session/:code/slide/:idx", put(session::set_slide))
        .route("/api/session/:code/summaries", get(session::list_summaries))
        .route(
            "/api/session/:code/students/:name/summaries",
            get(session::get_student_summary),
        )
        .route(&ws_path, get(websocket::handle_websocket))
        .layer(cors)
        .with_state(state)
}
