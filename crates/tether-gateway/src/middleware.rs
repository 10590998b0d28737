use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// Query parameter the credential may be passed in when the header is absent.
pub const CREDENTIAL_QUERY_PARAM: &str = "apiKey";

/// Read the credential from `header_name`, falling back to the `apiKey` query
/// parameter. Blank values count as absent.
pub fn extract_credential(
    headers: &HeaderMap,
    header_name: &str,
    query_key: Option<&str>,
) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| query_key.map(str::trim).filter(|v| !v.is_empty()))
        .map(str::to_string)
}

const ALL_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS";

/// CORS middleware.
///
/// Reflects the caller's `Origin` with credentials allowed, and answers every
/// `OPTIONS` request with `204` before it reaches routing or auth. With
/// credentials allowed browsers ignore `*` for methods, so the preflight's
/// requested method and headers are mirrored back instead.
pub async fn cors_middleware(request: Request, next: Next) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();
    let requested_method = request
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_METHOD)
        .cloned();
    let requested_headers = request
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned();

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    if let Some(origin) = origin {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        requested_method.unwrap_or_else(|| HeaderValue::from_static(ALL_METHODS)),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        requested_headers.unwrap_or_else(|| HeaderValue::from_static("*")),
    );
    response
}

/// Response headers appended to every response.
#[derive(Debug, Clone, Default)]
pub struct ExtraHeaders(pub Vec<(HeaderName, HeaderValue)>);

/// Append the configured headers to every response.
pub async fn extra_headers_middleware(
    State(extra): State<Arc<ExtraHeaders>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    for (name, value) in &extra.0 {
        headers.insert(name.clone(), value.clone());
    }
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware as axum_mw, routing::get, Router};
    use tower::ServiceExt;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_header_wins_over_query() {
        let h = headers(&[("x-api-key", "from-header")]);
        assert_eq!(
            extract_credential(&h, "x-api-key", Some("from-query")).as_deref(),
            Some("from-header")
        );
    }

    #[test]
    fn test_query_fallback_and_blank_values() {
        let h = headers(&[("x-api-key", "   ")]);
        assert_eq!(
            extract_credential(&h, "x-api-key", Some("q")).as_deref(),
            Some("q")
        );
        assert_eq!(extract_credential(&h, "x-api-key", Some("")), None);
        assert_eq!(extract_credential(&HeaderMap::new(), "x-api-key", None), None);
    }

    #[test]
    fn test_custom_header_name() {
        let h = headers(&[("authorization-token", "abc")]);
        assert_eq!(
            extract_credential(&h, "authorization-token", None).as_deref(),
            Some("abc")
        );
        assert_eq!(extract_credential(&h, "x-api-key", None), None);
    }

    fn app() -> Router {
        let extra = Arc::new(ExtraHeaders(vec![(
            HeaderName::from_static("x-served-by"),
            HeaderValue::from_static("tether"),
        )]));
        Router::new()
            .route("/thing", get(|| async { "ok" }))
            .layer(axum_mw::from_fn(cors_middleware))
            .layer(axum_mw::from_fn_with_state(extra, extra_headers_middleware))
    }

    #[tokio::test]
    async fn test_options_short_circuits_with_204() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/anything/at/all")
                    .header(header::ORIGIN, "https://app.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example"
        );
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
            "true"
        );
    }

    #[tokio::test]
    async fn test_preflight_mirrors_requested_method_and_headers() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/thing")
                    .header(header::ORIGIN, "https://app.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PUT")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type, x-api-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
            "PUT"
        );
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
            "content-type, x-api-key"
        );
    }

    #[tokio::test]
    async fn test_plain_request_lists_every_method() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/thing")
                    .header(header::ORIGIN, "https://app.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let methods = response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap()
            .to_string();
        for method in ["GET", "POST", "PUT", "PATCH", "DELETE"] {
            assert!(methods.contains(method), "{method} missing from {methods}");
        }
    }

    #[tokio::test]
    async fn test_origin_reflected_and_extra_headers_added() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/thing")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
        assert_eq!(response.headers()["x-served-by"], "tether");
    }

    #[tokio::test]
    async fn test_no_origin_no_allow_origin() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/thing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }
}
