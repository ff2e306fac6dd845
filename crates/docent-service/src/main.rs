//! Process entry point for the exhibition assistant orchestrator (spec.md
//! §4.9, C9). Parses CLI args the way the teacher's `querymt-service::Args`
//! does via `clap`, builds the dependency-injection container in the order
//! spec.md §9 prescribes (event store → cancellation fabric → registry →
//! cleaner → TTS dispatcher → orchestrator → tour machine → HTTP surface),
//! then serves until a shutdown signal fires every outstanding
//! cancellation token and the listener stops accepting connections.

mod metrics;
mod routes;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use docent_cancel::CancellationFabric;
use docent_core::config::Config;
use docent_events::EventStore;
use docent_orchestrator::{AudioBufferStore, Orchestrator, OrchestratorDeps};
use docent_providers::mock::{MockAsrProvider, MockRagProvider, MockTtsProvider};
use docent_providers::{AsrProvider, RagProvider, TtsProviderKind, VoiceConfig};
use docent_registry::RequestRegistry;
use docent_tour::TourMachine;
use docent_tour::prefetch::PrefetchPipeline;
use docent_tts::TtsDispatcher;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use metrics::Metrics;
use state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about = "HTTP/SSE surface for the exhibition assistant orchestrator")]
struct Args {
    /// Optional TOML config file; unspecified fields fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `bind_addr` from the config file.
    #[arg(long)]
    addr: Option<String>,

    /// `mock` wires deterministic in-process ASR/RAG/TTS stand-ins; `live`
    /// is not available in this build and fails fast (exit code 4).
    #[arg(long, default_value = "mock")]
    providers: String,

    /// Default TTS provider selected when a request does not specify one.
    #[arg(long, default_value = "edge")]
    tts_provider: String,
}

fn fallback_for(primary: TtsProviderKind) -> TtsProviderKind {
    if primary == TtsProviderKind::Sapi {
        TtsProviderKind::Edge
    } else {
        TtsProviderKind::Sapi
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(raw) => match Config::from_toml_str(&raw) {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, path = %path.display(), "failed to parse config file");
                    std::process::exit(2);
                }
            },
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to read config file");
                std::process::exit(2);
            }
        },
        None => Config::default(),
    };
    if let Some(addr) = &args.addr {
        config.bind_addr = addr.clone();
    }

    let default_tts_provider: TtsProviderKind = match args.tts_provider.parse() {
        Ok(p) => p,
        Err(_) => {
            error!(provider = %args.tts_provider, "unknown --tts-provider value");
            std::process::exit(2);
        }
    };

    match args.providers.as_str() {
        "mock" => {}
        "live" => {
            // No live ASR/RAG/TTS collaborators are wired into this build
            // (spec.md §1 Non-goals: the providers themselves are external
            // collaborators). Fail fast rather than serve with a silently
            // broken backend.
            error!("--providers live requested but no live collaborators are reachable at startup");
            std::process::exit(4);
        }
        other => {
            error!(providers = %other, "unknown --providers value");
            std::process::exit(2);
        }
    }

    let state = build_state(config.clone(), default_tts_provider);
    let fabric = state.fabric().clone();
    let app = routes::router(state);

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %config.bind_addr, "failed to bind listener");
            std::process::exit(3);
        }
    };
    info!(addr = %config.bind_addr, "docent-service listening");

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(fabric)).await {
        error!(error = %e, "server error");
    }
}

/// Builds the full DI container in the dependency order spec.md §9
/// prescribes, wired to the deterministic mock ASR/RAG/TTS collaborators.
/// Shared by `main` and by this crate's own integration tests.
fn build_state(config: Config, default_tts_provider: TtsProviderKind) -> AppState {
    let events = Arc::new(EventStore::new(config.event_retention));
    let fabric = Arc::new(CancellationFabric::new());
    let registry = Arc::new(RequestRegistry::new(&config.rate_limits));
    let audio_buffer = Arc::new(AudioBufferStore::new());

    let fallback = config.tts_fallback_enabled.then(|| fallback_for(default_tts_provider));
    let tts = Arc::new(TtsDispatcher::new(fallback));
    for kind in TtsProviderKind::ALL {
        tts.register(kind, Arc::new(MockTtsProvider::new()));
    }

    let asr: Arc<dyn AsrProvider> = Arc::new(MockAsrProvider::new("mock transcript"));
    let rag: Arc<dyn RagProvider> = Arc::new(MockRagProvider::new(vec![
        "欢迎参观，这里是展览的第一站。".to_string(),
        "这件展品融合了传统工艺与现代设计。".to_string(),
    ]));

    let deps = OrchestratorDeps {
        fabric: fabric.clone(),
        registry: registry.clone(),
        events: events.clone(),
        audio_buffer: audio_buffer.clone(),
        tts: tts.clone(),
        rag,
        asr: Some(asr.clone()),
        config: config.clone(),
    };
    let orchestrator = Arc::new(Orchestrator::new(deps));

    let prefetch = PrefetchPipeline::new(fabric.clone(), events.clone(), audio_buffer.clone(), config.prefetch_window);
    let default_voice = VoiceConfig::new();
    let tour = Arc::new(TourMachine::new(
        fabric.clone(),
        events.clone(),
        orchestrator.clone(),
        prefetch,
        audio_buffer.clone(),
        default_tts_provider,
        default_voice.clone(),
        config.continuous_tour_resume,
    ));

    let metrics = Arc::new(Metrics::default());
    AppState::new(
        fabric,
        registry,
        events,
        audio_buffer,
        tts,
        orchestrator,
        tour,
        Some(asr),
        config,
        metrics,
        default_tts_provider,
        default_voice,
    )
}

async fn shutdown_signal(fabric: docent_cancel::SharedFabric) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    let count = fabric.cancel_all();
    info!(count, "graceful shutdown: cancelled outstanding requests");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn router() -> axum::Router {
        routes::router(build_state(Config::default(), TtsProviderKind::Edge))
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let response = router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ask_without_client_id_header_is_bad_request() {
        let body = serde_json::json!({"question": "你好"}).to_string();
        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ask")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_requires_request_id_or_client_id() {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/cancel")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_unknown_request_id_reports_zero() {
        let body = serde_json::json!({"request_id": "ghost"}).to_string();
        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/cancel")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["cancelled"], 0);
    }

    #[tokio::test]
    async fn tour_state_for_unknown_client_reads_idle() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/tour/state")
                    .header("x-client-id", "c1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["mode"], "idle");
    }

    #[tokio::test]
    async fn tour_start_then_state_round_trips() {
        let app = router();
        let start_body = serde_json::json!({
            "stops": ["A", "B"],
            "zone": "z1",
            "profile": "adult",
            "template_id": "t1",
            "style": "formal",
            "duration_s": 30
        })
        .to_string();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tour/start")
                    .header("x-client-id", "c1")
                    .header("content-type", "application/json")
                    .body(Body::from(start_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/tour/state")
                    .header("x-client-id", "c1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["mode"], "running");
        assert_eq!(json["stop_index"], 0);
    }
}
