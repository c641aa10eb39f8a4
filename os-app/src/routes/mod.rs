pub mod agents;
pub mod approvals;
pub mod channels;
pub mod costs;
pub mod health;
pub mod messages;
pub mod skills;
pub mod voice;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(messages::router())
        .merge(skills::router())
        .merge(approvals::router())
        .merge(costs::router())
        .merge(agents::router())
        .merge(channels::router())
        .merge(voice::router())
}

/// Body shared by routes that cannot serve yet.
pub(crate) fn not_ready() -> (axum::http::StatusCode, axum::Json<serde_json::Value>) {
    (
        axum::http::StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(serde_json::json!({ "status": "error", "error": "Service not ready" })),
    )
}

#[cfg(test)]
pub(crate) mod test_util {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use axum::response::Response;

    pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    pub async fn body_json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        serde_json::from_slice(&body).expect("response json")
    }
}
