//! The success record honors the configured response log policy.

use std::sync::{Arc, Mutex};

use httpmock::prelude::*;
use payment_transport::{
    ConnectionPool, LogBodyLength, OutboundRequest, RequestExecutor, ResponseLogPolicy,
    SuppressBody, TokenCredential, TransportConfig,
};
use tracing_subscriber::layer::SubscriberExt;

/// Captures the `response` field of every INFO event.
#[derive(Clone, Default)]
struct ResponseCapture {
    responses: Arc<Mutex<Vec<String>>>,
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ResponseCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::INFO {
            let mut visitor = ResponseVisitor(None);
            event.record(&mut visitor);
            if let Some(response) = visitor.0 {
                self.responses.lock().unwrap().push(response);
            }
        }
    }
}

struct ResponseVisitor(Option<String>);

impl tracing::field::Visit for ResponseVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "response" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

async fn logged_responses(policy: Option<Arc<dyn ResponseLogPolicy>>) -> Vec<String> {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(POST).path("/nvp");
        then.status(200).body("TOKEN=EC-123&ACK=Success");
    });

    let capture = ResponseCapture::default();
    let responses = Arc::clone(&capture.responses);
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(capture));

    let mut exec = RequestExecutor::with_config(
        "ExpressCheckout",
        TransportConfig::for_testing(),
        Arc::new(ConnectionPool::new()),
    );
    if let Some(policy) = policy {
        exec = exec.with_log_policy(policy);
    }

    exec.execute(OutboundRequest::new(server.url("/nvp"), "x").credential(TokenCredential::new("t")))
        .await
        .unwrap();

    responses.lock().unwrap().clone()
}

#[tokio::test]
async fn full_body_logged_by_default() {
    let responses = logged_responses(None).await;
    assert_eq!(responses, ["TOKEN=EC-123&ACK=Success"]);
}

#[tokio::test]
async fn length_only_policy_hides_body() {
    let responses = logged_responses(Some(Arc::new(LogBodyLength))).await;
    assert_eq!(responses, ["<24 bytes>"]);
}

#[tokio::test]
async fn suppress_policy_emits_nothing() {
    let responses = logged_responses(Some(Arc::new(SuppressBody))).await;
    assert!(responses.is_empty(), "{responses:?}");
}
