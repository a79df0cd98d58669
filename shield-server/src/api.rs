use std::sync::Arc;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ShieldError, ShieldResult};
use crate::geo::{Coordinates, NEARBY_RADIUS_KM};
use crate::sos;
use crate::state::AppState;

pub const API_PATHS: &[&str] = &[
    "/register",
    "/update-location",
    "/send-sos",
    "/nearby-users",
    "/resolve-sos",
];

// ============================================
// Request / Response Bodies
// ============================================

/// Coordinate sent either as a JSON number or as a numeric string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CoordField {
    Number(f64),
    Text(String),
}

impl CoordField {
    fn value(&self) -> Option<f64> {
        match self {
            CoordField::Number(v) => Some(*v),
            CoordField::Text(s) => parse_coord(s),
        }
    }
}

fn parse_coord(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    username: Option<String>,
    emergency_email: Option<String>,
    emergency_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateLocationRequest {
    username: Option<String>,
    lat: Option<CoordField>,
    lon: Option<CoordField>,
}

#[derive(Debug, Deserialize)]
struct SosRequest {
    username: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    username: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiReply {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    notified: Option<Vec<String>>,
    #[serde(rename = "emailQueued", skip_serializing_if = "Option::is_none")]
    email_queued: Option<bool>,
}

impl ApiReply {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            notified: None,
            email_queued: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            notified: None,
            email_queued: None,
        }
    }
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to serialize response: {}", e);
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
        }
    };
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

pub fn plain_response(status: StatusCode, text: &'static str) -> Response<Body> {
    let mut resp = Response::new(Body::from(text));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp
}

fn error_response(err: &ShieldError) -> Response<Body> {
    json_response(err.status_code(), &ApiReply::failed(err.to_string()))
}

fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|v| !v.trim().is_empty())
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| {
            let v = v.replace('+', " ");
            match urlencoding::decode(&v) {
                Ok(s) => s.into_owned(),
                Err(_) => v,
            }
        })
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<ShieldResult<T>, hyper::Error> {
    let body_bytes = hyper::body::to_bytes(req.into_body()).await?;
    Ok(serde_json::from_slice::<T>(&body_bytes).map_err(|e| {
        warn!("Failed to parse request body: {}", e);
        ShieldError::Validation(format!("Invalid request body: {}", e))
    }))
}

// ============================================
// HTTP REST API Handlers
// ============================================

pub async fn handle_api_request(
    req: Request<Body>,
    app: Arc<AppState>,
) -> Result<Response<Body>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = match (method, path.as_str()) {
        // POST /register - emergency contact details
        (Method::POST, "/register") => match read_json::<RegisterRequest>(req).await? {
            Ok(body) => register(&app, body).await,
            Err(e) => Err(e),
        },
        // POST /update-location - latest coordinates
        (Method::POST, "/update-location") => match read_json::<UpdateLocationRequest>(req).await? {
            Ok(body) => update_location(&app, body).await,
            Err(e) => Err(e),
        },
        // POST /send-sos - raise an alert and notify everyone in range
        (Method::POST, "/send-sos") => match read_json::<SosRequest>(req).await? {
            Ok(body) => send_sos(&app, body).await,
            Err(e) => Err(e),
        },
        // POST /resolve-sos - clear an active alert
        (Method::POST, "/resolve-sos") => match read_json::<ResolveRequest>(req).await? {
            Ok(body) => resolve_sos(&app, body).await,
            Err(e) => Err(e),
        },
        // GET /nearby-users?username=..&lat=..&lon=..
        (Method::GET, "/nearby-users") => {
            let query = req.uri().query().unwrap_or("").to_string();
            nearby_users(&app, &query).await
        }
        _ => return Ok(plain_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")),
    };

    Ok(match result {
        Ok(resp) => resp,
        Err(e) => {
            warn!("{} rejected ({}): {}", path, e.status_code(), e);
            error_response(&e)
        }
    })
}

async fn register(app: &AppState, body: RegisterRequest) -> ShieldResult<Response<Body>> {
    let (Some(username), Some(email), Some(number)) = (
        non_empty(body.username),
        non_empty(body.emergency_email),
        non_empty(body.emergency_number),
    ) else {
        return Err(ShieldError::Validation("Missing fields".to_string()));
    };

    app.shield.lock().await.registry.register(&username, &email, &number)?;
    info!("Registered user: {}", username);
    Ok(json_response(StatusCode::OK, &ApiReply::ok("Registered successfully")))
}

async fn update_location(app: &AppState, body: UpdateLocationRequest) -> ShieldResult<Response<Body>> {
    let Some(username) = non_empty(body.username) else {
        return Err(ShieldError::Validation("Missing fields".to_string()));
    };
    let lat = body.lat.as_ref().and_then(CoordField::value);
    let lon = body.lon.as_ref().and_then(CoordField::value);

    app.shield
        .lock()
        .await
        .registry
        .update_location(&username, lat, lon)?;
    Ok(json_response(StatusCode::OK, &ApiReply::ok("Location updated")))
}

async fn send_sos(app: &AppState, body: SosRequest) -> ShieldResult<Response<Body>> {
    let (Some(username), Some(location)) = (non_empty(body.username), non_empty(body.location)) else {
        return Err(ShieldError::Validation("Missing fields".to_string()));
    };

    let outcome = sos::trigger(&app.shield, &app.mail, &username, &location).await?;
    let reply = ApiReply {
        success: true,
        message: "SOS triggered (email + socket notifications, SMS via frontend)".to_string(),
        notified: Some(outcome.notified),
        email_queued: Some(outcome.email_queued),
    };
    Ok(json_response(StatusCode::OK, &reply))
}

async fn resolve_sos(app: &AppState, body: ResolveRequest) -> ShieldResult<Response<Body>> {
    let Some(username) = non_empty(body.username) else {
        return Err(ShieldError::Validation("Missing fields".to_string()));
    };

    let mut st = app.shield.lock().await;
    let was_active = sos::resolve(&mut st, &username)?;
    let message = if was_active {
        "SOS resolved"
    } else {
        "No active SOS"
    };
    Ok(json_response(StatusCode::OK, &ApiReply::ok(message)))
}

async fn nearby_users(app: &AppState, query: &str) -> ShieldResult<Response<Body>> {
    let username = non_empty(query_param(query, "username"));
    let lat = query_param(query, "lat").as_deref().and_then(parse_coord);
    let lon = query_param(query, "lon").as_deref().and_then(parse_coord);

    let (Some(username), Some(lat), Some(lon)) = (username, lat, lon) else {
        return Err(ShieldError::Validation(
            "Missing username or location for filtering".to_string(),
        ));
    };

    let st = app.shield.lock().await;
    let users = st
        .registry
        .nearby(&Coordinates::new(lat, lon), NEARBY_RADIUS_KM, &username);
    Ok(json_response(StatusCode::OK, &users))
}
