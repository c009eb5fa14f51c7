//! Admin-key middleware for the operator routes.
//!
//! When an admin key is configured, requests must carry it via the
//! `X-Admin-Key` header or `Authorization: Bearer <key>`. When no key is
//! configured (the `Option` is `None`), all requests pass (development
//! mode). Node and client routes are not behind this layer — they carry
//! their own credentials.

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};

// ---------------------------------------------------------------------------
// AdminAuthLayer
// ---------------------------------------------------------------------------

/// A [`tower::Layer`] that wraps services with [`AdminAuthMiddleware`].
#[derive(Clone)]
pub struct AdminAuthLayer {
    /// `None` = development mode (all requests pass through).
    admin_key: Option<Arc<String>>,
}

impl AdminAuthLayer {
    pub fn new(admin_key: Option<String>) -> Self {
        Self {
            admin_key: admin_key.map(Arc::new),
        }
    }
}

impl<S> Layer<S> for AdminAuthLayer {
    type Service = AdminAuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdminAuthMiddleware {
            inner,
            admin_key: self.admin_key.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// AdminAuthMiddleware
// ---------------------------------------------------------------------------

/// The actual middleware service produced by [`AdminAuthLayer`].
#[derive(Clone)]
pub struct AdminAuthMiddleware<S> {
    inner: S,
    admin_key: Option<Arc<String>>,
}

impl<S> Service<Request<Body>> for AdminAuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let admin_key = self.admin_key.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let expected = match admin_key {
                Some(key) => key,
                None => return inner.call(req).await,
            };

            let provided = req
                .headers()
                .get("x-admin-key")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
                .or_else(|| {
                    req.headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.strip_prefix("Bearer "))
                        .map(|s| s.to_string())
                });

            match provided {
                Some(ref key) if bool::from(key.as_bytes().ct_eq(expected.as_bytes())) => {
                    inner.call(req).await
                }
                _ => {
                    let resp = (
                        StatusCode::UNAUTHORIZED,
                        axum::Json(serde_json::json!({"error": "admin credentials required"})),
                    )
                        .into_response();
                    Ok(resp)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
