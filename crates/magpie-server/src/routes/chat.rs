use crate::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use magpie::agent::Agent;
use magpie::preprocess::DocQueryPreprocessor;
use magpie::providers::base::Provider;
use magpie::providers::configs::ProviderConfig;
use magpie::providers::factory;
use magpie::router::{ToolRouter, ToolServer};
use magpie::sampling::SamplingBridge;
use magpie::transport::TransportClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ErrorResponse>)> {
    info!(prompt_len = request.prompt.len(), "received chat request");

    match run_conversation(state, request.prompt).await {
        Ok(response) => Ok(Json(ChatResponse { response })),
        Err(err) => {
            error!(%err, "chat request failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("Error during processing: {err}"),
                }),
            ))
        }
    }
}

/// One conversation, fully isolated: its own provider handle, its own tool
/// server subprocess, its own agent. Axum runs each request on its own task,
/// so a slow tool here never stalls another conversation.
async fn run_conversation(state: AppState, prompt: String) -> anyhow::Result<String> {
    let provider_config = state.provider_config();
    let model = provider_config.model.clone();
    let provider: Box<dyn Provider> =
        factory::get_provider(ProviderConfig::OpenRouter(provider_config))?;
    let provider: Arc<dyn Provider> = Arc::from(provider);

    let bridge = Arc::new(SamplingBridge::new(Arc::clone(&provider), model));
    let client = TransportClient::connect(state.doc_server_config(), Some(bridge)).await?;
    let handle: Arc<dyn ToolServer> = Arc::new(client.clone());

    let mut router = ToolRouter::new();
    router.register(Arc::clone(&handle));

    let mut agent = Agent::new(Arc::clone(&provider), router)
        .with_preprocessor(Box::new(DocQueryPreprocessor::new(handle)));

    // The loop itself cannot fail; setup above can.
    let answer = agent.run(&prompt).await;
    client.shutdown().await;
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{DocServerSettings, ProviderSettings, ServerSettings, Settings};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(doc_command: &str) -> AppState {
        AppState::new(Settings {
            server: ServerSettings::default(),
            provider: ProviderSettings {
                host: "http://127.0.0.1:9".to_string(),
                api_key: "test-key".to_string(),
                model: "test-model".to_string(),
                temperature: None,
                max_tokens: None,
            },
            docs: DocServerSettings {
                command: doc_command.to_string(),
                args: Vec::new(),
            },
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = routes(test_state("doc-server"));
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn test_chat_setup_failure_is_500_with_detail() {
        let app = routes(test_state("magpie-no-such-doc-server"));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"prompt": "hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let detail = value["error"].as_str().unwrap();
        assert!(detail.starts_with("Error during processing:"));
        assert!(detail.contains("magpie-no-such-doc-server") || detail.contains("spawn"));
    }
}
