mod v1;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use axum::routing::get;
use stampede_core::Engine;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// The REST control surface for a running test. Bound once at startup;
/// shares the engine with the run loop and only touches it through the
/// executor's synchronized accessors and registry snapshots.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl ApiServer {
    pub async fn start(addr: SocketAddr, engine: Arc<Engine>) -> anyhow::Result<ApiServer> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind control API: {addr}"))?;
        let addr = listener
            .local_addr()
            .context("failed to resolve control API address")?;

        let app = router(engine);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = serve.await;
        });

        Ok(ApiServer {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/v1/status", get(v1::get_status).patch(v1::patch_status))
        .route("/v1/metrics", get(v1::list_metrics))
        .route("/v1/metrics/{name}", get(v1::get_metric))
        .route("/v1/groups", get(v1::get_groups))
        .with_state(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stampede_core::http::HttpRequest;
    use stampede_core::{HttpClient, Options, SourceData};
    use stampede_lua::LuaRunner;

    async fn test_server(options: Options) -> (ApiServer, Arc<Engine>) {
        let src = SourceData {
            filename: "api_test.lua".to_string(),
            data: b"function Default() end".to_vec(),
        };
        let runner = Arc::new(
            LuaRunner::new(&src, Vec::new()).unwrap_or_else(|e| panic!("{e}")),
        );
        let options = options.normalize().unwrap_or_else(|e| panic!("{e}"));
        let engine =
            Arc::new(Engine::new(runner, &options).unwrap_or_else(|e| panic!("{e}")));

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap_or_else(|e| panic!("{e}"));
        let server = ApiServer::start(addr, engine.clone())
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        (server, engine)
    }

    #[tokio::test]
    async fn status_round_trip() {
        let (server, engine) = test_server(Options {
            vus: Some(5),
            vus_max: Some(50),
            duration: Some(std::time::Duration::from_secs(60)),
            ..Default::default()
        })
        .await;

        let client = HttpClient::default();
        let response = client
            .get(&format!("{}/v1/status", server.url()))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(response.status, 200);

        let status: serde_json::Value =
            serde_json::from_slice(&response.body).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(status["vus"], 5);
        assert_eq!(status["vus-max"], 50);
        assert_eq!(status["running"], false);
        assert_eq!(status["tainted"], false);

        // Raise the VU count through the API.
        let mut patch = HttpRequest::post(&format!("{}/v1/status", server.url()), Bytes::new());
        patch.method = http_method_patch();
        patch.body = Bytes::from_static(br#"{"vus": 20}"#);
        patch
            .headers
            .push(("content-type".to_string(), "application/json".to_string()));
        let response = client.request(patch).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(response.status, 200);
        assert_eq!(engine.executor().vus(), 20);

        // Above the cap is rejected.
        let mut patch = HttpRequest::post(&format!("{}/v1/status", server.url()), Bytes::new());
        patch.method = http_method_patch();
        patch.body = Bytes::from_static(br#"{"vus": 1000}"#);
        patch
            .headers
            .push(("content-type".to_string(), "application/json".to_string()));
        let response = client.request(patch).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(response.status, 400);
        assert_eq!(engine.executor().vus(), 20);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn metrics_and_groups_endpoints_respond() {
        let (server, _engine) = test_server(Options {
            iterations: Some(1),
            ..Default::default()
        })
        .await;

        let client = HttpClient::default();

        let response = client
            .get(&format!("{}/v1/metrics", server.url()))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(response.status, 200);
        let metrics: serde_json::Value =
            serde_json::from_slice(&response.body).unwrap_or_else(|e| panic!("{e}"));
        let names: Vec<&str> = metrics
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|m| m["name"].as_str())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        assert!(names.contains(&"iterations"));

        let response = client
            .get(&format!("{}/v1/metrics/iterations", server.url()))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(response.status, 200);

        let response = client
            .get(&format!("{}/v1/metrics/no_such_metric", server.url()))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(response.status, 404);

        let response = client
            .get(&format!("{}/v1/groups", server.url()))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(response.status, 200);

        server.shutdown().await;
    }

    fn http_method_patch() -> http::Method {
        http::Method::PATCH
    }
}
