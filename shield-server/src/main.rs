mod api;
mod config;
mod error;
mod geo;
mod handshake;
mod mailer;
mod messages;
mod sos;
mod state;
mod static_files;
mod ws;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info, warn};

use crate::config::ServerConfig;
use crate::mailer::{LogMailer, MailQueue, Mailer, SmtpMailer};
use crate::state::AppState;

fn with_cors(mut resp: Response<Body>) -> Response<Body> {
    let headers = resp.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, OPTIONS"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    resp
}

// ============================================
// Main Request Handler
// ============================================

async fn handle_request(
    mut req: Request<Body>,
    app: Arc<AppState>,
    remote: SocketAddr,
) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    // CORS preflight
    if method == Method::OPTIONS {
        let mut resp = api::plain_response(StatusCode::NO_CONTENT, "");
        resp.headers_mut()
            .insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
        return Ok(with_cors(resp));
    }

    if path == "/health" {
        return Ok(with_cors(api::plain_response(StatusCode::OK, "ok")));
    }

    if api::API_PATHS.contains(&path.as_str()) {
        let resp = api::handle_api_request(req, app).await?;
        return Ok(with_cors(resp));
    }

    if hyper_tungstenite::is_upgrade_request(&req) {
        return match hyper_tungstenite::upgrade(&mut req, None) {
            Ok((response, websocket)) => {
                tokio::spawn(async move {
                    match websocket.await {
                        Ok(ws) => ws::handle_connection(ws, remote, app).await,
                        Err(e) => warn!("WebSocket handshake with {} failed: {}", remote, e),
                    }
                });
                Ok(with_cors(response))
            }
            Err(e) => {
                error!("WebSocket upgrade error: {}", e);
                Ok(api::plain_response(
                    StatusCode::BAD_REQUEST,
                    "Invalid WebSocket upgrade request",
                ))
            }
        };
    }

    if method == Method::GET {
        return Ok(with_cors(static_files::serve(&app.frontend_dir, &path).await));
    }

    Ok(with_cors(api::plain_response(StatusCode::NOT_FOUND, "Not found")))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

fn build_mailer(config: &ServerConfig) -> Arc<dyn Mailer> {
    match &config.email {
        Some(settings) => match SmtpMailer::new(settings) {
            Ok(mailer) => {
                info!("SMTP email enabled via {}:{}", settings.smtp_host, settings.smtp_port);
                Arc::new(mailer)
            }
            Err(e) => {
                warn!("SMTP setup failed; emails will only be logged: {}", e);
                Arc::new(LogMailer)
            }
        },
        None => {
            info!("Email disabled (EMAIL_USER/EMAIL_PASS not set); emails will only be logged");
            Arc::new(LogMailer)
        }
    }
}

// ============================================
// Main Entry Point
// ============================================

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    // Healthcheck mode: exit 0 if the port is taken (server running), 1 otherwise.
    if std::env::args().any(|a| a == "--healthcheck") {
        let probe = SocketAddr::from(([127, 0, 0, 1], config.addr.port()));
        match std::net::TcpListener::bind(probe) {
            Ok(_) => std::process::exit(1),
            Err(_) => std::process::exit(0),
        }
    }

    let mail = MailQueue::start(build_mailer(&config), config.email_queue_capacity);
    let app = Arc::new(AppState::new(mail, config.frontend_dir.clone()));

    let svc_app = app.clone();
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let app = svc_app.clone();
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, app.clone(), remote)))
        }
    });

    let builder = match Server::try_bind(&config.addr) {
        Ok(builder) => builder,
        Err(e) => {
            error!("Failed to bind {}: {}", config.addr, e);
            std::process::exit(1);
        }
    };
    let server = builder
        .serve(make_svc)
        .with_graceful_shutdown(shutdown_signal());

    info!("Citizen Shield backend listening on http://{}", config.addr);
    info!("WebSocket endpoint: ws://{}", config.addr);
    info!("Serving frontend from {}", config.frontend_dir.display());

    if let Err(e) = server.await {
        error!("Server error: {}", e);
    }

    app.shield.lock().await.teardown();
    info!("Server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::testing::recording_queue;

    fn app() -> Arc<AppState> {
        let (mail, _sent) = recording_queue(false);
        let dir = std::env::temp_dir().join(format!("shield-main-{}", uuid::Uuid::new_v4()));
        Arc::new(AppState::new(mail, dir))
    }

    fn remote() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    #[tokio::test]
    async fn websocket_upgrade_carries_cors() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("/ws")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();

        let resp = handle_request(req, app(), remote()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(resp.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn head_is_not_served_from_the_frontend() {
        let req = Request::builder()
            .method(Method::HEAD)
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let resp = handle_request(req, app(), remote()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn health_and_preflight() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = handle_request(req, app(), remote()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/send-sos")
            .body(Body::empty())
            .unwrap();
        let resp = handle_request(req, app(), remote()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(resp.headers()[ACCESS_CONTROL_MAX_AGE], "86400");
    }
}
