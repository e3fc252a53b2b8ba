//! HTTP menu-decision layer.
//!
//! Sits in front of an opaque boot-configuration handler. Requests for
//! anything but `/ipxe` pass straight through. For `/ipxe`, a successful
//! downstream answer is forwarded untouched; anything else is swallowed and
//! the client gets the boot menu instead, so firmware that the downstream
//! cannot place still boots somewhere useful.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{error, info};

use crate::template::MenuEngine;

pub async fn menu_or_passthrough(
    State(engine): State<Arc<MenuEngine>>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() != "/ipxe" {
        return next.run(request).await;
    }

    let response = next.run(request).await;
    if response.status() == StatusCode::OK {
        return response;
    }

    info!(status = %response.status(), "downstream had no answer, serving menu");
    match engine.render() {
        Ok(script) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            script,
        )
            .into_response(),
        Err(err) => {
            error!(%err, "menu render failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Wrap `downstream` with the menu-decision middleware.
pub fn router(engine: Arc<MenuEngine>, downstream: Router) -> Router {
    downstream.layer(middleware::from_fn_with_state(engine, menu_or_passthrough))
}
