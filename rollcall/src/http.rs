//! HTTP surface of the roster service.
//!
//! Every route answers with a JSON envelope `{ message, success, data }`. A
//! write that reaches a follower is re-issued verbatim against the leader and
//! the leader's answer is relayed back.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::entity::{Entity, EntityPatch};
use crate::error::{Error, Result};
use crate::service::RosterService;

/// Marks a request relayed from a follower; such a request is never relayed again.
pub const FORWARDED_HEADER: &str = "x-rollcall-forwarded";

#[derive(Debug, Serialize)]
struct Reply {
    message: String,
    success: bool,
    data: Value,
}

fn json_response(status: StatusCode, reply: &Reply) -> Response<Body> {
    let body = serde_json::to_vec(reply).unwrap_or_default();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn success(data: Value) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &Reply {
            message: "success".to_string(),
            success: true,
            data,
        },
    )
}

fn failure(status: StatusCode, message: String) -> Response<Body> {
    json_response(
        status,
        &Reply {
            message,
            success: false,
            data: Value::Null,
        },
    )
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Invalid(_) | Error::Codec(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) | Error::Deleted(_) => StatusCode::NOT_FOUND,
        Error::AlreadyExists(_) => StatusCode::CONFLICT,
        Error::Redirect { .. } => StatusCode::MISDIRECTED_REQUEST,
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Error::Tier(_) => StatusCode::BAD_GATEWAY,
        Error::NoLeader | Error::Consensus(_) | Error::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Decodes `application/x-www-form-urlencoded` pairs; `+` is a space.
fn parse_query(query: Option<&str>) -> Result<HashMap<String, String>> {
    let decode = |raw: &str| {
        urlencoding::decode(&raw.replace('+', " "))
            .map(|value| value.into_owned())
            .map_err(|e| Error::Invalid(format!("malformed query: {}", e)))
    };
    query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| Ok((decode(key)?, decode(value)?)))
        .collect()
}

fn param<'a>(query: &'a HashMap<String, String>, name: &str) -> &'a str {
    query.get(name).map(String::as_str).unwrap_or_default()
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Invalid(format!("malformed body: {}", e)))
}

fn to_value<T: Serialize>(data: &T) -> Result<Value> {
    serde_json::to_value(data).map_err(|e| Error::Codec(e.to_string()))
}

pub struct Router {
    service: Arc<RosterService>,
    client: Client<HttpConnector>,
}

impl Router {
    pub fn new(service: Arc<RosterService>) -> Self {
        Router {
            service,
            client: Client::new(),
        }
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let (parts, body) = req.into_parts();
        let body = match hyper::body::to_bytes(body).await {
            Ok(body) => body,
            Err(e) => return failure(StatusCode::BAD_REQUEST, e.to_string()),
        };

        let result = match (&parts.method, parts.uri.path()) {
            (&Method::POST, "/student/save") => self.save(&body).await,
            (&Method::GET, "/student/search") => self.search(&parts).await,
            (&Method::PUT, "/student/update") => self.update(&parts, &body).await,
            (&Method::DELETE, "/student/delete") => self.delete(&parts).await,
            (&Method::GET, "/join") => self.join(&parts).await,
            _ => return failure(StatusCode::NOT_FOUND, format!("no route for {}", parts.uri.path())),
        };

        match result {
            Ok(data) => success(data),
            Err(Error::Redirect { leader_addr }) if !parts.headers.contains_key(FORWARDED_HEADER) => {
                self.forward(&leader_addr, &parts, body).await
            }
            Err(e) => {
                if e.is_domain() {
                    log::debug!("{} {} failed: {}", parts.method, parts.uri, e);
                } else {
                    log::warn!("{} {} failed: {}", parts.method, parts.uri, e);
                }
                failure(status_for(&e), e.to_string())
            }
        }
    }

    async fn save(&self, body: &[u8]) -> Result<Value> {
        let entity: Entity = decode(body)?;
        self.service.create_entity(entity).await?;
        Ok(Value::Null)
    }

    async fn search(&self, parts: &Parts) -> Result<Value> {
        let query = parse_query(parts.uri.query())?;
        let entity = self.service.get_entity(param(&query, "id")).await?;
        to_value(&entity)
    }

    async fn update(&self, parts: &Parts, body: &[u8]) -> Result<Value> {
        let query = parse_query(parts.uri.query())?;
        let patch: EntityPatch = decode(body)?;
        self.service
            .update_entity(param(&query, "id"), patch)
            .await?;
        Ok(Value::Null)
    }

    async fn delete(&self, parts: &Parts) -> Result<Value> {
        let query = parse_query(parts.uri.query())?;
        self.service.delete_entity(param(&query, "id")).await?;
        Ok(Value::Null)
    }

    async fn join(&self, parts: &Parts) -> Result<Value> {
        let query = parse_query(parts.uri.query())?;
        self.service
            .join(param(&query, "peerID"), param(&query, "peerAddr"))
            .await?;
        Ok(Value::Null)
    }

    /// Re-issues the request at the leader and relays its answer.
    async fn forward(&self, leader_addr: &str, parts: &Parts, body: Bytes) -> Response<Body> {
        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(format!("http://{}{}", leader_addr, path))
            .header(FORWARDED_HEADER, "1");
        if let Some(content_type) = parts.headers.get(CONTENT_TYPE) {
            builder = builder.header(CONTENT_TYPE, content_type.clone());
        }
        let request = match builder.body(Body::from(body)) {
            Ok(request) => request,
            Err(e) => return failure(StatusCode::BAD_REQUEST, e.to_string()),
        };

        log::debug!("forwarding {} {} to leader {}", parts.method, path, leader_addr);
        match self.client.request(request).await {
            Ok(response) => response,
            Err(e) => failure(
                StatusCode::BAD_GATEWAY,
                format!("failed to reach the leader at {}: {}", leader_addr, e),
            ),
        }
    }
}

/// Serves `router` on `listener` in the background and returns the bound address.
pub fn spawn_server(listener: TcpListener, router: Arc<Router>) -> std::result::Result<SocketAddr, hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let router = router.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let router = router.clone();
                async move { Ok::<_, Infallible>(router.handle(req).await) }
            }))
        }
    });
    let server = hyper::Server::from_tcp(listener)?.serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(async move {
        if let Err(e) = server.await {
            log::error!("http server failed: {}", e);
        }
    });
    log::info!("http server started on {}", addr);
    Ok(addr)
}
