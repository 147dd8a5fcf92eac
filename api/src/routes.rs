use crate::app::App;
use http_body_util::{combinators::BoxBody, BodyExt};
use http_body_util::{Empty, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use payments_worker::gateway_type::GatewayType;
use payments_worker::payment_message::PaymentMessage;
use payments_worker::store::GatewaySummary;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

fn empty() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> ResponseBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn status(code: StatusCode) -> Response<ResponseBody> {
    let mut res = Response::new(empty());
    *res.status_mut() = code;
    res
}

#[derive(Serialize)]
struct Summary {
    default: GatewaySummary,
    fallback: GatewaySummary,
}

pub async fn route<B>(req: Request<B>, app: Arc<App>) -> Result<Response<ResponseBody>, Infallible>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let res = match (req.method(), req.uri().path()) {
        (_, "/health") => Response::new(full("OK")),
        (&Method::POST, "/payments") => create_payment(req, &app).await,
        (&Method::GET, "/payments-summary") => {
            let params = parse_query_params(&req);
            payments_summary(&app, &params).await
        }
        (&Method::POST, "/purge-payments") => purge_payments(&app).await,
        (_, "/payments" | "/payments-summary" | "/purge-payments") => {
            status(StatusCode::METHOD_NOT_ALLOWED)
        }
        _ => status(StatusCode::NOT_FOUND),
    };
    Ok(res)
}

async fn create_payment<B>(req: Request<B>, app: &App) -> Response<ResponseBody>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::debug!(error = %e, "Failed reading request body");
            return status(StatusCode::BAD_REQUEST);
        }
    };

    let msg = match serde_json::from_slice::<PaymentMessage>(&body) {
        Ok(msg) if msg.is_admissible() => msg,
        Ok(_) => return status(StatusCode::BAD_REQUEST),
        Err(e) => {
            tracing::debug!(error = %e, "Invalid payment body");
            return status(StatusCode::BAD_REQUEST);
        }
    };

    if !app.admit(msg) {
        return status(StatusCode::SERVICE_UNAVAILABLE);
    }
    status(StatusCode::ACCEPTED)
}

fn parse_query_params<B>(req: &Request<B>) -> HashMap<String, String> {
    let query = req.uri().query().unwrap_or("");
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// Nanosecond score for a query bound. Missing or unparseable bounds score 0.
fn score_param(params: &HashMap<String, String>, key: &str) -> i128 {
    params
        .get(key)
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
        .map(OffsetDateTime::unix_timestamp_nanos)
        .unwrap_or(0)
}

async fn payments_summary(app: &App, params: &HashMap<String, String>) -> Response<ResponseBody> {
    let from = score_param(params, "from");
    let to = score_param(params, "to");

    let mut totals = [GatewaySummary::default(); 2];
    for (gateway, total) in GatewayType::ALL.into_iter().zip(totals.iter_mut()) {
        match app.store.range_query(gateway, from, to).await {
            Ok(records) => match GatewaySummary::from_records(&records) {
                Ok(summary) => *total = summary,
                Err(e) => {
                    tracing::error!(%gateway, error = %e, "Failed to aggregate payments summary");
                    return status(StatusCode::INTERNAL_SERVER_ERROR);
                }
            },
            Err(e) => {
                tracing::error!(%gateway, error = %e, "Failed to query payments summary");
                return status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }

    let [default, fallback] = totals;
    match serde_json::to_string(&Summary { default, fallback }) {
        Ok(json) => {
            let mut ok = Response::new(full(json));
            ok.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            ok
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode payments summary");
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn purge_payments(app: &App) -> Response<ResponseBody> {
    match app.store.purge().await {
        Ok(()) => status(StatusCode::OK),
        Err(e) => {
            tracing::error!(error = %e, "Failed to purge payments");
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
