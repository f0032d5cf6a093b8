// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Order Ingress
//!
//! HTTP surface of the producer. `POST /order` takes an order as JSON and publishes
//! it to the main route:
//!
//! | Case | Status |
//! |---|---|
//! | published | `202 Accepted`, `{"status":"order accepted"}` |
//! | body is not an order | `400 Bad Request` |
//! | method other than POST | `405 Method Not Allowed` |
//! | publish failed | `500 Internal Server Error` |
//!
//! Every request is counted and timed by a middleware layer, rejected ones included.

use crate::{
    order::Order,
    publisher::{PublishMessage, Publisher},
    telemetry::{HTTP_REQUESTS, HTTP_REQUEST_SECONDS, PUBLISH_ERROR, PUBLISH_SUCCESS},
    topology::{ORDERS_EXCHANGE, ORDERS_QUEUE},
};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use metrics::{counter, histogram};
use std::{sync::Arc, time::Instant};
use tracing::{error, info};

#[derive(Clone)]
struct IngressState {
    publisher: Arc<dyn Publisher>,
}

/// Builds the producer router.
pub fn router(publisher: Arc<dyn Publisher>) -> Router {
    Router::new()
        .route("/order", post(submit_order))
        .layer(middleware::from_fn(track_requests))
        .with_state(IngressState { publisher })
}

async fn track_requests(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    counter!(HTTP_REQUESTS).increment(1);

    let response = next.run(req).await;

    histogram!(HTTP_REQUEST_SECONDS).record(started.elapsed().as_secs_f64());
    response
}

async fn submit_order(State(state): State<IngressState>, body: Bytes) -> Response {
    let order = match Order::from_slice(&body) {
        Ok(order) => order,
        Err(err) => {
            return json_error(StatusCode::BAD_REQUEST, "invalid_json", err.to_string());
        }
    };

    let data = match order.to_vec() {
        Ok(data) => data,
        Err(err) => {
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding_failed",
                err.to_string(),
            );
        }
    };

    let msg = PublishMessage::new(ORDERS_EXCHANGE, ORDERS_QUEUE, data);
    if let Err(err) = state.publisher.publish(&msg).await {
        counter!(PUBLISH_ERROR).increment(1);
        error!(error = err.to_string(), order_id = order.id, "error publishing order");
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "publish_failed",
            err.to_string(),
        );
    }

    counter!(PUBLISH_SUCCESS).increment(1);
    info!(order_id = order.id, value = order.value, "order published");

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "order accepted" })),
    )
        .into_response()
}

fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::AmqpError, publisher::MockPublisher};
    use metrics::{
        Counter, CounterFn, Gauge, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
        SharedString, Unit,
    };
    use std::{collections::HashMap, sync::Mutex};
    use tower::ServiceExt;

    type Counts = Arc<Mutex<HashMap<String, u64>>>;

    struct Tally {
        name: String,
        counts: Counts,
    }

    impl Tally {
        fn bump(&self, by: u64) {
            let mut counts = self.counts.lock().unwrap();
            *counts.entry(self.name.clone()).or_default() += by;
        }
    }

    impl CounterFn for Tally {
        fn increment(&self, value: u64) {
            self.bump(value);
        }

        fn absolute(&self, _value: u64) {}
    }

    impl HistogramFn for Tally {
        fn record(&self, _value: f64) {
            self.bump(1);
        }
    }

    #[derive(Default)]
    struct TallyRecorder {
        counts: Counts,
    }

    impl TallyRecorder {
        fn tally(&self, key: &Key) -> Arc<Tally> {
            Arc::new(Tally {
                name: key.name().to_owned(),
                counts: Arc::clone(&self.counts),
            })
        }

        fn count(&self, name: &str) -> u64 {
            let counts = self.counts.lock().unwrap();
            counts.get(name).copied().unwrap_or_default()
        }
    }

    impl Recorder for TallyRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            Counter::from_arc(self.tally(key))
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::from_arc(self.tally(key))
        }
    }

    async fn send(router: Router, method: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri("/order")
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn valid_order_is_published_to_main_route() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|msg| {
                let order: Order = serde_json::from_slice(&msg.data).unwrap();
                msg.exchange == ORDERS_EXCHANGE
                    && msg.routing_key == ORDERS_QUEUE
                    && msg.headers.is_empty()
                    && order == Order::new("a", 1500.0)
            })
            .times(1)
            .returning(|_| Ok(()));

        let (status, json) = send(
            router(Arc::new(publisher)),
            "POST",
            r#"{"id":"a","value":1500}"#,
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["status"], "order accepted");
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        let (status, json) = send(
            router(Arc::new(publisher)),
            "POST",
            r#"{"id":"x","value":"oops"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_json");
    }

    #[tokio::test]
    async fn other_methods_are_not_allowed() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        let (status, _) = send(router(Arc::new(publisher)), "GET", "").await;

        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn publish_failure_is_a_server_error() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|msg| Err(AmqpError::PublishingError(msg.routing_key.clone())));

        let (status, json) = send(
            router(Arc::new(publisher)),
            "POST",
            r#"{"id":"a","value":1}"#,
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "publish_failed");
    }

    #[test]
    fn every_request_is_counted_and_timed() {
        let recorder = TallyRecorder::default();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let mut publisher = MockPublisher::new();
                publisher.expect_publish().times(1).returning(|_| Ok(()));
                let app = router(Arc::new(publisher));

                let (accepted, _) = send(app.clone(), "POST", r#"{"id":"a","value":1}"#).await;
                let (refused, _) = send(app.clone(), "GET", "").await;
                let (invalid, _) = send(app, "POST", "not json").await;

                assert_eq!(accepted, StatusCode::ACCEPTED);
                assert_eq!(refused, StatusCode::METHOD_NOT_ALLOWED);
                assert_eq!(invalid, StatusCode::BAD_REQUEST);
            })
        });

        assert_eq!(recorder.count(HTTP_REQUESTS), 3);
        assert_eq!(recorder.count(HTTP_REQUEST_SECONDS), 3);
        assert_eq!(recorder.count(PUBLISH_SUCCESS), 1);
    }
}
