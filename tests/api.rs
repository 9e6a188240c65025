//! End-to-end API tests with a scripted toolchain standing in for the real
//! external tools.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::routing::get;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

use pwapack::config::ServerConfig;
use pwapack::errors::PipelineError;
use pwapack::jobs::{EventKind, JobId, JobStatus, JobStore, ProgressEvent};
use pwapack::pipeline::{LineSink, Stage, ToolInvocation, ToolOutput, Toolchain};
use pwapack::server::{AppState, SharedState, build_router};

/// Plays the part of bubblewrap, keytool, Gradle and apksigner: records
/// every invocation and fabricates the files each real tool would leave
/// behind.
struct FakeToolchain {
    invocations: Mutex<Vec<ToolInvocation>>,
    fail_stage: Option<Stage>,
}

impl FakeToolchain {
    fn new() -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            fail_stage: None,
        }
    }

    fn failing_at(stage: Stage) -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            fail_stage: Some(stage),
        }
    }

    fn stages(&self) -> Vec<Stage> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|inv| inv.stage)
            .collect()
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn invoke(
        &self,
        invocation: &ToolInvocation,
        on_line: Option<LineSink<'_>>,
    ) -> Result<ToolOutput, PipelineError> {
        self.invocations.lock().unwrap().push(invocation.clone());

        if self.fail_stage == Some(invocation.stage) {
            return Ok(ToolOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "scripted tool failure\n".to_string(),
            });
        }

        match invocation.stage {
            Stage::Generate => {}
            Stage::Keystore => {
                std::fs::write(invocation.cwd.join("signing.keystore"), b"keystore").unwrap();
            }
            Stage::Build => {
                if let Some(sink) = on_line {
                    sink("> Task :app:assembleRelease");
                    sink("BUILD SUCCESSFUL in 42s");
                }
                let release_dir = invocation.cwd.join("app/build/outputs/apk/release");
                std::fs::create_dir_all(&release_dir).unwrap();
                std::fs::write(release_dir.join("app-release-unsigned.apk"), b"unsigned").unwrap();
            }
            Stage::Sign => {
                let out = invocation
                    .args
                    .iter()
                    .position(|arg| arg == "--out")
                    .and_then(|i| invocation.args.get(i + 1))
                    .expect("sign invocation carries --out");
                std::fs::write(out, b"signed-apk-bytes").unwrap();
            }
        }

        Ok(ToolOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

fn test_state(toolchain: Arc<FakeToolchain>, dev_mode: bool) -> (SharedState, tempfile::TempDir) {
    let work_root = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        dev_mode,
        work_root: work_root.path().to_path_buf(),
        ..ServerConfig::default()
    };
    (AppState::new(config, toolchain), work_root)
}

fn build_body(state: &SharedState, icon_url: &str) -> Value {
    json!({
        "url": "https://app.example.com",
        "name": "My App",
        "short_name": "MyApp",
        "package_id": "com.example.myapp",
        "display": "standalone",
        "orientation": "default",
        "theme_color": "#112233",
        "background_color": "#FFFFFF",
        "icon_url": icon_url,
        "token": state.issuer.generate(),
    })
}

async fn submit_build(state: &SharedState, body: Value) -> JobId {
    let response = build_router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/build")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let bytes = to_bytes(response.into_body(), 1024).await.unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    json["job_id"].as_str().unwrap().parse().unwrap()
}

async fn wait_terminal(store: &JobStore, id: JobId) -> Vec<ProgressEvent> {
    let (_, mut rx) = store.subscribe(id).expect("job exists");
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("build did not finish in time")
            .expect("event channel closed before a terminal event");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

#[tokio::test]
async fn full_build_lifecycle() {
    let toolchain = Arc::new(FakeToolchain::new());
    let (state, _work_root) = test_state(toolchain.clone(), false);

    let job_id = submit_build(&state, build_body(&state, "https://app.example.com/icon.png")).await;
    let events = wait_terminal(&state.store, job_id).await;

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Complete);
    assert_eq!(last.percent, Some(100));
    let messages: Vec<&str> = events.iter().filter_map(|e| e.message.as_deref()).collect();
    assert!(messages.contains(&"Build queued"));
    assert!(messages.contains(&"Building APK"));
    assert!(messages.contains(&"BUILD SUCCESSFUL in 42s"));

    // Percent never moves backwards across the whole stream.
    let percents: Vec<u8> = events.iter().filter_map(|e| e.percent).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));

    assert_eq!(
        toolchain.stages(),
        vec![Stage::Generate, Stage::Keystore, Stage::Build, Stage::Sign]
    );

    let snapshot = state.store.get(job_id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Complete);
    assert_eq!(snapshot.file_name.as_deref(), Some("MyApp.apk"));
    let work_dir = snapshot.work_dir.clone().unwrap();
    assert!(work_dir.join("twa-manifest.json").exists());

    // First download hands over the artifact and deletes the job.
    let response = build_router(state.clone())
        .oneshot(
            Request::builder()
                .uri(format!("/api/build/{}/download", job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/vnd.android.package-archive"
    );
    assert!(
        response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("MyApp.apk")
    );
    let bytes = to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(bytes.as_ref(), b"signed-apk-bytes");

    assert!(state.store.get(job_id).is_none());
    assert!(!work_dir.exists());

    // Second download finds nothing.
    let response = build_router(state.clone())
        .oneshot(
            Request::builder()
                .uri(format!("/api/build/{}/download", job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn tool_failure_marks_the_job_error() {
    let toolchain = Arc::new(FakeToolchain::failing_at(Stage::Build));
    let (state, _work_root) = test_state(toolchain, false);

    let job_id = submit_build(&state, build_body(&state, "https://app.example.com/icon.png")).await;
    let events = wait_terminal(&state.store, job_id).await;

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    let message = last.message.as_deref().unwrap();
    assert!(message.contains("APK build"));
    assert!(message.contains("scripted tool failure"));

    let snapshot = state.store.get(job_id).unwrap();
    assert_eq!(snapshot.status, JobStatus::Error);
    assert!(snapshot.error_message.is_some());
    // The working directory is gone; only the job record remains.
    assert!(!snapshot.work_dir.unwrap().exists());
}

#[tokio::test]
async fn sse_stream_replays_history_and_terminates() {
    let toolchain = Arc::new(FakeToolchain::new());
    let (state, _work_root) = test_state(toolchain, false);

    let job_id = submit_build(&state, build_body(&state, "https://app.example.com/icon.png")).await;
    wait_terminal(&state.store, job_id).await;

    // The job is terminal, so the stream replays everything and ends.
    let response = build_router(state.clone())
        .oneshot(
            Request::builder()
                .uri(format!("/api/build/{}/stream", job_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    let events: Vec<Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    assert!(!events.is_empty());
    assert_eq!(events[0]["message"], "Build queued");
    let last = events.last().unwrap();
    assert_eq!(last["type"], "complete");
    assert_eq!(last["percent"], 100);
    // Exactly one terminal event.
    assert_eq!(
        events.iter().filter(|e| e["type"] != "log").count(),
        1
    );
}

async fn serve_svg(svg: &'static str) -> Option<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await.ok()?;
    let addr = listener.local_addr().ok()?;
    let app = Router::new().route(
        "/icon.svg",
        get(move || async move { ([(header::CONTENT_TYPE, "image/svg+xml")], svg) }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Some(format!("http://{}/icon.svg", addr))
}

#[tokio::test]
async fn svg_icons_are_rasterized_and_substituted() {
    const SVG: &str = concat!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="32" height="32">"#,
        r##"<circle cx="16" cy="16" r="14" fill="#cc0000"/></svg>"##
    );
    let Some(icon_url) = serve_svg(SVG).await else {
        // Sandboxed environments may refuse loopback binds.
        return;
    };

    let toolchain = Arc::new(FakeToolchain::new());
    let (state, _work_root) = test_state(toolchain, true);

    let job_id = submit_build(&state, build_body(&state, &icon_url)).await;
    let events = wait_terminal(&state.store, job_id).await;
    assert_eq!(events.last().unwrap().kind, EventKind::Complete);

    // The generator's manifest must reference the rasterized PNG, never
    // the original SVG URL.
    let work_dir = state.store.get(job_id).unwrap().work_dir.unwrap();
    let manifest = std::fs::read_to_string(work_dir.join("twa-manifest.json")).unwrap();
    let manifest: Value = serde_json::from_str(&manifest).unwrap();
    let substituted = manifest["iconUrl"].as_str().unwrap();
    assert!(!substituted.contains(".svg"));
    assert!(substituted.starts_with("http://127.0.0.1:"));
    assert!(substituted.ends_with("/icon.png"));
}

#[tokio::test]
async fn blocked_manifest_hosts_are_forbidden() {
    let toolchain = Arc::new(FakeToolchain::new());
    let (state, _work_root) = test_state(toolchain, false);

    let response = build_router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/manifest")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "url": "https://169.254.169.254/latest/meta-data" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let bytes = to_bytes(response.into_body(), 1024).await.unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(json["error"].as_str().unwrap().contains("not allowed"));
}
