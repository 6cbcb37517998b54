use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::api::rate_limit::RateLimiter;
use crate::config::SchedulerConfig;
use crate::engine::dispatch::Dispatcher;
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub dispatcher: Arc<Dispatcher>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &SchedulerConfig) -> Self {
        Self {
            storage: dispatcher.storage().clone(),
            rate_limiter: Arc::new(RateLimiter::new(
                config.rate_limit_requests,
                Duration::from_secs(config.rate_limit_window_secs),
            )),
            dispatcher,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/missions", post(handlers::create_mission))
        .route("/missions", get(handlers::list_missions))
        .route("/missions/:id", get(handlers::get_mission))
        .route("/missions/:id/agents", get(handlers::get_mission_agents))
        .route("/missions/:id/findings", get(handlers::get_mission_findings))
        .route("/missions/:id/events", get(handlers::get_mission_events))
        .route("/missions/:id/tick", post(handlers::tick_mission))
        .route("/agents/:id", get(handlers::get_agent))
        .route("/agents/:id/messages", get(handlers::get_agent_messages))
        .route("/agents/:id/input", post(handlers::respond_to_agent))
        .route("/agents/:id/pause", post(handlers::pause_agent))
        .route("/agents/:id/resume", post(handlers::resume_agent))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    log::info!("Canopy API server listening on port {}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::billing::UnmeteredBilling;
    use crate::providers::{MockLLMProvider, MockSearchProvider};
    use crate::storage::memory::InMemoryStore;
    use crate::types::{AgentStatus, Mission};

    fn create_test_app_with(
        llm: MockLLMProvider,
        config: SchedulerConfig,
    ) -> (Router, Arc<InMemoryStore>) {
        let storage = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::new(
            storage.clone(),
            Arc::new(llm),
            Some(Arc::new(MockSearchProvider::new())),
            Arc::new(UnmeteredBilling),
            config.clone(),
        );
        let state = AppState::new(Arc::new(dispatcher), &config);
        (create_router(state), storage)
    }

    fn create_test_app() -> (Router, Arc<InMemoryStore>) {
        create_test_app_with(MockLLMProvider::new(), SchedulerConfig::default())
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_create_mission() {
        let (app, storage) = create_test_app();

        let response = app
            .oneshot(post_json("/missions", r#"{"objective": "Survey the bay"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["objective"], "Survey the bay");
        assert_eq!(json["status"], "active");

        let missions = storage.list_missions(None).await.unwrap();
        assert_eq!(missions.len(), 1);
    }

    #[tokio::test]
    async fn test_create_mission_rejects_blank_objective() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(post_json("/missions", r#"{"objective": "  "}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_missions_empty() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(Request::builder().uri("/missions").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_mission_not_found() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/missions/00000000-0000-0000-0000-000000000000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tick_iterates_root() {
        let (app, storage) = create_test_app();
        let mission = Mission::new("Survey the bay".to_string());
        storage.create_mission(&mission).await.unwrap();
        let root = crate::types::Agent::root(mission.id, mission.objective.clone());
        storage.create_agent(&root).await.unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/missions/{}/tick", mission.id),
                r#"{"mode": "iterate"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "iterated");
        assert_eq!(json["agent_id"], root.id.to_string());

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/missions/{}", mission.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["agent_count"], 1);
        assert_eq!(json["terminal_agents"], 0);
    }

    #[tokio::test]
    async fn test_tick_without_body_defaults_to_iterate() {
        let (app, storage) = create_test_app();
        let mission = Mission::new("Survey".to_string());
        storage.create_mission(&mission).await.unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/missions/{}/tick", mission.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "no_agent_available");
    }

    #[tokio::test]
    async fn test_tick_is_rate_limited_per_key() {
        let config = SchedulerConfig {
            rate_limit_requests: 1,
            ..SchedulerConfig::default()
        };
        let (app, storage) = create_test_app_with(MockLLMProvider::new(), config);
        let mission = Mission::new("Survey".to_string());
        storage.create_mission(&mission).await.unwrap();
        let uri = format!("/missions/{}/tick", mission.id);

        let tick = |key: &str| {
            Request::builder()
                .method("POST")
                .uri(&uri)
                .header("x-api-key", key)
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(tick("alpha")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.clone().oneshot(tick("alpha")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let other = app.oneshot(tick("beta")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_input_endpoint() {
        let llm = MockLLMProvider::with_responses([r#"{"input_request": "Which bay?"}"#]);
        let (app, storage) = create_test_app_with(llm, SchedulerConfig::default());
        let mission = Mission::new("Survey".to_string());
        storage.create_mission(&mission).await.unwrap();
        let root = crate::types::Agent::root(mission.id, mission.objective.clone());
        storage.create_agent(&root).await.unwrap();

        let response = app
            .clone()
            .oneshot(post_json(&format!("/missions/{}/tick", mission.id), "{}"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "waiting_for_input");

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/agents/{}/input", root.id),
                r#"{"response": "Monterey"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "working");

        let stored = storage.get_agent(root.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Working);

        let response = app
            .oneshot(post_json(
                &format!("/agents/{}/input", root.id),
                r#"{"response": "again"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_get_agent_not_found() {
        let (app, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/agents/00000000-0000-0000-0000-000000000000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_agent_messages() {
        let (app, storage) = create_test_app();
        let mission = Mission::new("Survey".to_string());
        storage.create_mission(&mission).await.unwrap();
        let root = crate::types::Agent::root(mission.id, mission.objective.clone());
        storage.create_agent(&root).await.unwrap();
        storage
            .append_messages(root.id, &[crate::types::Message::user("hello")])
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/agents/{}/messages", root.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json[0]["content"], "hello");
    }
}
