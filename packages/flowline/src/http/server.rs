use crate::{config::Config, dispatcher::Dispatcher, AppContext};
use axum::{
    middleware,
    routing::{get, post},
};
use axum_tracing_opentelemetry::middleware::OtelAxumLayer;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utils::telemetry::HttpMetrics;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use wildmatch::WildMatch;

use super::{
    handlers::{
        executions::{
            handle_cancel_execution, handle_enqueue_execution, handle_get_execution,
            handle_retry_execution, handle_retry_node,
        },
        handle_not_found,
        health::{handle_health, handle_info},
        openapi::ApiDoc,
        production::{handle_queue_heartbeat, handle_ready},
        resume::{handle_resume_get, handle_resume_post},
        webhooks::handle_webhook,
        workflows::{handle_list_versions, handle_promote_version, handle_validate_version},
    },
    state::HttpState,
};

const REALM: &str = "flowline";

// this is called from main
pub fn start(
    ctx: AppContext,
    config: Config,
    dispatcher: Arc<Dispatcher>,
    metrics: HttpMetrics,
) -> anyhow::Result<()> {
    // The server runs within the tokio runtime
    ctx.rt.clone().block_on(async move {
        let (host, port) = (config.host.clone(), config.port);

        let mut shutdown_signal = ctx.get_kill_receiver();

        let router = make_router(config, dispatcher, metrics);

        let listener = tokio::net::TcpListener::bind(&format!("{}:{}", host, port)).await?;

        tracing::info!("Http server starting on: {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal.recv().await.ok();

                tracing::debug!("Http server shutting down");
            })
            .await?;

        anyhow::Ok(())
    })?;

    Ok(())
}

// this is called from main and tests
pub fn make_router(
    config: Config,
    dispatcher: Arc<Dispatcher>,
    metrics: HttpMetrics,
) -> axum::Router {
    let state = HttpState::new(config.clone(), dispatcher, metrics);

    // public routes: ingress, callbacks, health surfaces
    let public = axum::Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(OtelAxumLayer::default())
        .route("/health", get(handle_health))
        .route("/info", get(handle_info))
        .route("/api/webhooks/{webhook_id}", post(handle_webhook))
        .route(
            "/api/runs/{execution_id}/nodes/{node_id}/resume",
            get(handle_resume_get).post(handle_resume_post),
        )
        .route("/api/production/queue/heartbeat", get(handle_queue_heartbeat))
        .route("/api/production/ready", get(handle_ready));

    // management routes (bearer-protected when configured)
    let protected = axum::Router::new()
        .route("/api/workflows/{id}/versions", get(handle_list_versions))
        .route(
            "/api/workflows/{id}/versions/{vid}/validate",
            post(handle_validate_version),
        )
        .route(
            "/api/workflows/{id}/versions/{vid}/promote",
            post(handle_promote_version),
        )
        .route("/api/executions", post(handle_enqueue_execution))
        .route("/api/executions/{execution_id}", get(handle_get_execution))
        .route(
            "/api/executions/{execution_id}/retry",
            post(handle_retry_execution),
        )
        .route(
            "/api/executions/{execution_id}/nodes/{node_id}/retry",
            post(handle_retry_node),
        )
        .route(
            "/api/executions/{execution_id}/cancel",
            post(handle_cancel_execution),
        );

    let public = public.with_state(state.clone());
    let protected = protected.with_state(state);

    // apply bearer auth to protected routes if configured
    let mut router = public
        .merge(match &config.bearer_token {
            Some(token) => protected.layer(middleware::from_fn_with_state(
                (token.clone(), REALM.to_string()),
                utils::http::auth::verify_bearer_with_realm,
            )),
            None => protected,
        })
        .fallback(handle_not_found);

    if let Some(cors) = cors_layer(&config) {
        router = router.layer(cors);
    }

    router
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    if config.cors_allowed_origins.is_empty() {
        None
    } else {
        let allowed_origins: Vec<WildMatch> = config
            .cors_allowed_origins
            .iter()
            .map(|s| WildMatch::new(s))
            .collect();

        Some(
            CorsLayer::new()
                // using a predicate so we have more flexibility over wildcard patterns
                .allow_origin(tower_http::cors::AllowOrigin::predicate(
                    move |origin, _parts| {
                        origin
                            .to_str()
                            .map(|origin| {
                                allowed_origins
                                    .iter()
                                    .any(|allowed_origin| allowed_origin.matches(origin))
                            })
                            .unwrap_or(false)
                    },
                ))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
    }
}
