use crate::gateway_type::GatewayType;
use crate::payment::Payment;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub const HEALTH_ENDPOINT: &str = "/payments/service-health";
pub const PAYMENTS_ENDPOINT: &str = "/payments";

const WIRE_TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
    #[error("failed reading response body: {0}")]
    Body(#[from] hyper::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("failed building request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("failed encoding payment: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of handing a payment to a processor.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The processor took the payment (2xx).
    Accepted,
    /// Worth trying again later: transport failures, timeouts, 5xx, 408, 429.
    Retryable(GatewayError),
    /// The processor refused this payment; retrying will not change that.
    Rejected(GatewayError),
}

#[derive(Debug, Serialize)]
pub struct PaymentRequest<'a> {
    #[serde(rename = "correlationId")]
    pub correlation_id: &'a str,
    pub amount: Decimal,
    #[serde(rename = "requestedAt", serialize_with = "wire_timestamp")]
    pub requested_at: OffsetDateTime,
}

impl<'a> From<&'a Payment> for PaymentRequest<'a> {
    fn from(p: &'a Payment) -> Self {
        Self {
            correlation_id: &p.correlation_id,
            amount: p.amount,
            requested_at: p.requested_at,
        }
    }
}

fn wire_timestamp<S: Serializer>(at: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
    let formatted = at
        .to_offset(UtcOffset::UTC)
        .format(WIRE_TIMESTAMP)
        .map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&formatted)
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// HTTP adapter for one upstream payment processor.
pub struct PaymentGateway {
    gateway: GatewayType,
    health_url: String,
    payments_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
    health_timeout: Duration,
    request_timeout: Duration,
}

impl PaymentGateway {
    pub fn new(
        gateway: GatewayType,
        base_url: &str,
        health_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(128)
            .pool_timer(TokioTimer::new())
            .build(HttpConnector::new());
        let base_url = base_url.trim_end_matches('/');

        Self {
            gateway,
            health_url: format!("{}{}", base_url, HEALTH_ENDPOINT),
            payments_url: format!("{}{}", base_url, PAYMENTS_ENDPOINT),
            client,
            health_timeout,
            request_timeout,
        }
    }

    pub fn gateway_type(&self) -> GatewayType {
        self.gateway
    }

    /// Fetches the processor's raw health payload. Any failure is returned as
    /// an error; interpreting it is up to the caller.
    pub async fn probe_health(&self) -> Result<Bytes, GatewayError> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(&self.health_url)
            .body(Full::new(Bytes::new()))?;

        let exchange = async {
            let res = self.client.request(req).await?;
            let status = res.status();
            let body = res.into_body().collect().await?.to_bytes();
            if !status.is_success() {
                return Err(GatewayError::Status(status));
            }
            Ok::<_, GatewayError>(body)
        };

        tokio::time::timeout(self.health_timeout, exchange)
            .await
            .map_err(|_| GatewayError::Timeout(self.health_timeout))?
    }

    pub async fn submit(&self, payment: &Payment) -> SubmitOutcome {
        let request = match self.build_submit(payment) {
            Ok(request) => request,
            Err(e) => return SubmitOutcome::Rejected(e),
        };

        let exchange = async {
            let res = self.client.request(request).await?;
            let status = res.status();
            // Drain so the connection goes back to the pool.
            let _ = res.into_body().collect().await;
            Ok::<_, GatewayError>(status)
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Err(_) => SubmitOutcome::Retryable(GatewayError::Timeout(self.request_timeout)),
            Ok(Err(e)) => SubmitOutcome::Retryable(e),
            Ok(Ok(status)) if status.is_success() => SubmitOutcome::Accepted,
            Ok(Ok(status)) if is_retryable(status) => {
                SubmitOutcome::Retryable(GatewayError::Status(status))
            }
            Ok(Ok(status)) => SubmitOutcome::Rejected(GatewayError::Status(status)),
        }
    }

    fn build_submit(&self, payment: &Payment) -> Result<Request<Full<Bytes>>, GatewayError> {
        let body = serde_json::to_vec(&PaymentRequest::from(payment))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(&self.payments_url)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use tokio::net::TcpListener;

    fn payment() -> Payment {
        Payment::new(
            "4a7901b8-7d26-4d9d-aa19-4dc1c7cf60b3".to_string(),
            Decimal::new(1990, 2),
            GatewayType::Default,
            datetime!(2025-07-15 12:34:56 UTC),
        )
    }

    fn gateway(url: &str) -> PaymentGateway {
        PaymentGateway::new(
            GatewayType::Default,
            url,
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn payment_request_uses_wire_format() {
        let p = payment();
        let json = serde_json::to_value(PaymentRequest::from(&p)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "correlationId": "4a7901b8-7d26-4d9d-aa19-4dc1c7cf60b3",
                "amount": 19.9,
                "requestedAt": "2025-07-15T12:34:56.000Z"
            })
        );
    }

    #[tokio::test]
    async fn probe_returns_body_on_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", HEALTH_ENDPOINT)
            .with_status(200)
            .with_body(r#"{"failing":false,"minResponseTime":100}"#)
            .create_async()
            .await;

        let body = gateway(&server.url()).probe_health().await.unwrap();
        assert_eq!(&body[..], br#"{"failing":false,"minResponseTime":100}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn probe_fails_on_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", HEALTH_ENDPOINT)
            .with_status(429)
            .create_async()
            .await;

        let err = gateway(&server.url()).probe_health().await.unwrap_err();
        assert!(matches!(err, GatewayError::Status(StatusCode::TOO_MANY_REQUESTS)));
    }

    #[tokio::test]
    async fn submit_classifies_responses() {
        let cases = [
            (200, "accepted"),
            (500, "retryable"),
            (503, "retryable"),
            (429, "retryable"),
            (422, "rejected"),
            (400, "rejected"),
        ];

        for (status, expected) in cases {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("POST", PAYMENTS_ENDPOINT)
                .match_header("content-type", "application/json")
                .with_status(status)
                .create_async()
                .await;

            let outcome = gateway(&server.url()).submit(&payment()).await;
            let actual = match outcome {
                SubmitOutcome::Accepted => "accepted",
                SubmitOutcome::Retryable(_) => "retryable",
                SubmitOutcome::Rejected(_) => "rejected",
            };
            assert_eq!(actual, expected, "status {status}");
        }
    }

    #[tokio::test]
    async fn submit_sends_payment_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", PAYMENTS_ENDPOINT)
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "correlationId": "4a7901b8-7d26-4d9d-aa19-4dc1c7cf60b3",
                "requestedAt": "2025-07-15T12:34:56.000Z"
            })))
            .with_status(200)
            .create_async()
            .await;

        let outcome = gateway(&server.url()).submit(&payment()).await;
        assert!(matches!(outcome, SubmitOutcome::Accepted));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unresponsive_processor_times_out_as_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                open.push(stream);
            }
        });

        let gateway = PaymentGateway::new(
            GatewayType::Fallback,
            &format!("http://{addr}"),
            Duration::from_millis(100),
            Duration::from_millis(100),
        );

        let outcome = gateway.submit(&payment()).await;
        assert!(matches!(
            outcome,
            SubmitOutcome::Retryable(GatewayError::Timeout(_))
        ));
        assert!(matches!(
            gateway.probe_health().await,
            Err(GatewayError::Timeout(_))
        ));
    }
}
