pub mod servers;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use crate::auth::{TokenGate, auth_middleware, server_exists};
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    // Layers run outermost-last: authentication first, then the existence check.
    let gate = |permission| {
        middleware::from_fn_with_state(TokenGate::new(&state, permission), auth_middleware)
    };
    let exists = || middleware::from_fn_with_state(state.clone(), server_exists);

    Router::new()
        .route("/", get(servers::index))
        .route(
            "/api/servers",
            get(servers::list_servers).layer(gate("i:servers")),
        )
        .route(
            "/api/servers/{server}",
            get(servers::get_server).layer(exists()).layer(gate("s:view")),
        )
        .route(
            "/api/servers/{server}/power",
            post(servers::server_power)
                .layer(exists())
                .layer(gate("s:power")),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wharf_env::types::ExitState;
    use wharf_env::{
        Environment, EnvironmentKind, Error, ResourceUsage, Server, ServerCollection, ServerId,
        Signal,
    };

    use crate::config::AppConfig;
    use crate::dispatcher::PowerDispatcher;

    const TOKEN: &str = "test-token";

    #[derive(Default)]
    struct Calls {
        start: AtomicUsize,
        stop: AtomicUsize,
        terminate: Mutex<Vec<Signal>>,
    }

    impl Calls {
        fn total(&self) -> usize {
            self.start.load(Ordering::SeqCst)
                + self.stop.load(Ordering::SeqCst)
                + self.terminate.lock().unwrap().len()
        }
    }

    /// Counts power operations; everything else is inert.
    struct RecordingEnvironment {
        calls: Arc<Calls>,
        fail_start: bool,
    }

    #[async_trait]
    impl Environment for RecordingEnvironment {
        fn name(&self) -> EnvironmentKind {
            EnvironmentKind::Docker
        }
        async fn is_running(&self) -> wharf_env::Result<bool> {
            Ok(false)
        }
        async fn in_situ_update(&self) -> wharf_env::Result<()> {
            Ok(())
        }
        async fn on_before_start(&self) -> wharf_env::Result<()> {
            Ok(())
        }
        async fn start(&self) -> wharf_env::Result<()> {
            self.calls.start.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(Error::NotCreated);
            }
            Ok(())
        }
        async fn stop(&self) -> wharf_env::Result<()> {
            self.calls.stop.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn wait_for_stop(&self, _: Duration, _: bool) -> wharf_env::Result<()> {
            Ok(())
        }
        async fn exists(&self) -> wharf_env::Result<bool> {
            Ok(true)
        }
        async fn terminate(&self, signal: Signal) -> wharf_env::Result<()> {
            self.calls.terminate.lock().unwrap().push(signal);
            Ok(())
        }
        async fn destroy(&self) -> wharf_env::Result<()> {
            Ok(())
        }
        async fn exit_state(&self) -> wharf_env::Result<ExitState> {
            Err(Error::NoExitState)
        }
        async fn create(&self) -> wharf_env::Result<()> {
            Ok(())
        }
        async fn attach(&self) -> wharf_env::Result<()> {
            Ok(())
        }
        async fn follow_console_output(&self) -> wharf_env::Result<()> {
            Ok(())
        }
        async fn send_command(&self, _: &str) -> wharf_env::Result<()> {
            Err(Error::NotAttached)
        }
        async fn readlog(&self, _: u64) -> wharf_env::Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn enable_resource_polling(&self) -> wharf_env::Result<()> {
            Ok(())
        }
        async fn disable_resource_polling(&self) -> wharf_env::Result<()> {
            Ok(())
        }
        fn resources(&self) -> ResourceUsage {
            ResourceUsage {
                memory_bytes: 1024,
                ..Default::default()
            }
        }
    }

    struct Harness {
        app: Router,
        calls: Arc<Calls>,
        dispatcher: PowerDispatcher,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_failing_start(false)
        }

        fn with_failing_start(fail_start: bool) -> Self {
            let calls = Arc::new(Calls::default());
            let servers = ServerCollection::new();
            servers
                .add(Server::new(
                    ServerId::from("abc"),
                    Box::new(RecordingEnvironment {
                        calls: calls.clone(),
                        fail_start,
                    }),
                ))
                .unwrap();

            let dispatcher = PowerDispatcher::new();
            let state = AppState {
                servers,
                config: Arc::new(AppConfig {
                    listen_addr: "127.0.0.1:0".parse().unwrap(),
                    token: TOKEN.into(),
                    servers_file: PathBuf::from("servers.json"),
                    data_dir: PathBuf::from("/tmp"),
                    log_dir: PathBuf::from("/tmp"),
                    poll_interval: Duration::from_secs(5),
                    shutdown_grace: Duration::from_secs(1),
                }),
                dispatcher: dispatcher.clone(),
            };

            Self {
                app: api_router(state),
                calls,
                dispatcher,
            }
        }

        async fn send(&self, req: Request<Body>) -> (StatusCode, header::HeaderMap, Vec<u8>) {
            let resp = self.app.clone().oneshot(req).await.unwrap();
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp.into_body().collect().await.unwrap().to_bytes();
            (status, headers, body.to_vec())
        }

        /// Wait for every dispatched power action to finish.
        async fn settle(&self) {
            self.dispatcher.shutdown(Duration::from_secs(5)).await;
        }
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn power(server: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/servers/{server}/power"))
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn index_needs_no_credentials() {
        let h = Harness::new();
        let (status, _, body) = h.send(get("/", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"Welcome!\n");
    }

    #[tokio::test]
    async fn protected_routes_demand_bearer_header() {
        let h = Harness::new();

        for uri in ["/api/servers", "/api/servers/abc", "/api/servers/missing"] {
            let (status, headers, _) = h.send(get(uri, None)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
            assert_eq!(headers[header::WWW_AUTHENTICATE], "Bearer");
        }

        let req = Request::builder()
            .method("POST")
            .uri("/api/servers/abc/power")
            .header(header::AUTHORIZATION, format!("Token {TOKEN}"))
            .body(Body::from(r#"{"action":"start"}"#))
            .unwrap();
        let (status, _, _) = h.send(req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        h.settle().await;
        assert_eq!(h.calls.total(), 0);
    }

    #[tokio::test]
    async fn non_global_token_is_not_implemented() {
        let h = Harness::new();
        let (status, _, body) = h.send(get("/api/servers/abc", Some("someone-else"))).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "not implemented");
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let h = Harness::new();
        let (status, _, _) = h.send(get("/api/servers/unknown-id", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = h.send(power("unknown-id", r#"{"action":"start"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        h.settle().await;
        assert_eq!(h.calls.total(), 0);
    }

    #[tokio::test]
    async fn lists_servers_as_projections() {
        let h = Harness::new();
        let (status, _, body) = h.send(get("/api/servers", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["uuid"], "abc");
        assert_eq!(json[0]["environment"], "docker");
        assert_eq!(json[0]["resources"]["memory_bytes"], 1024);
    }

    #[tokio::test]
    async fn shows_single_server() {
        let h = Harness::new();
        let (status, _, body) = h.send(get("/api/servers/abc", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["uuid"], "abc");
    }

    #[tokio::test]
    async fn start_is_accepted_and_runs_once() {
        let h = Harness::new();
        let (status, _, body) = h.send(power("abc", r#"{"action":"start"}"#)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body.is_empty());

        h.settle().await;
        assert_eq!(h.calls.start.load(Ordering::SeqCst), 1);
        assert_eq!(h.calls.total(), 1);
    }

    #[tokio::test]
    async fn bytes_after_the_first_json_value_are_ignored() {
        let h = Harness::new();
        let (status, _, _) = h
            .send(power("abc", "{\"action\":\"start\"}\n{\"action\":\"kill\"}"))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        h.settle().await;
        assert_eq!(h.calls.start.load(Ordering::SeqCst), 1);
        assert_eq!(h.calls.total(), 1);
    }

    #[tokio::test]
    async fn failing_start_is_still_accepted() {
        let h = Harness::with_failing_start(true);
        let (status, _, _) = h.send(power("abc", r#"{"action":"start"}"#)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        h.settle().await;
        assert_eq!(h.calls.start.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_and_kill_reach_the_environment() {
        let h = Harness::new();
        for body in [r#"{"action":"stop"}"#, r#"{"action":"kill"}"#] {
            let (status, _, _) = h.send(power("abc", body)).await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }

        h.settle().await;
        assert_eq!(h.calls.stop.load(Ordering::SeqCst), 1);
        assert_eq!(*h.calls.terminate.lock().unwrap(), vec![Signal::SIGKILL]);
    }

    #[tokio::test]
    async fn restart_is_accepted_without_effect() {
        let h = Harness::new();
        let (status, _, _) = h.send(power("abc", r#"{"action":"restart"}"#)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        h.settle().await;
        assert_eq!(h.calls.total(), 0);
    }

    #[tokio::test]
    async fn unknown_action_is_not_found() {
        let h = Harness::new();
        for body in [
            r#"{"action":"explode"}"#,
            r#"{}"#,
            "null",
            r#"{"action":"START"}"#,
        ] {
            let (status, _, _) = h.send(power("abc", body)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
        }

        h.settle().await;
        assert_eq!(h.calls.total(), 0);
    }

    #[tokio::test]
    async fn undecodable_body_is_internal_error() {
        let h = Harness::new();
        for body in ["", "  \n", r#"{"action":"#, "not json", r#"{"action":5}"#] {
            let (status, _, resp) = h.send(power("abc", body)).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{body}");

            let json: serde_json::Value = serde_json::from_slice(&resp).unwrap();
            assert_eq!(json["error"], "could not parse power action from request");
        }

        h.settle().await;
        assert_eq!(h.calls.total(), 0);
    }
}
