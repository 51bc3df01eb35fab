use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn dossier_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("dossier");
    path
}

/// Write a config with no storage and no pipeline URLs, so every outbound
/// call fails as an upstream error.
fn setup_test_env_with(port: u16, extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/dossier.sqlite"

[server]
bind = "127.0.0.1:{}"

[upload]
batch_stagger_ms = 10

[outbox]
poll_interval_secs = 3600
{}
"#,
        root.display(),
        port,
        extra
    );

    let config_path = config_dir.join("dossier.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn setup_test_env() -> (TempDir, PathBuf) {
    setup_test_env_with(8787, "")
}

fn run_dossier(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dossier_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dossier binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn create_dossier(config_path: &Path) -> String {
    let (stdout, stderr, success) = run_dossier(config_path, &["create", "--owner", "user-1"]);
    assert!(success, "create failed: {}", stderr);
    stdout.trim().to_string()
}

// ============ CLI ============

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_dossier(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_dossier(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_dossier(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_create_list_show() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);

    let (stdout, _, success) = run_dossier(
        &config_path,
        &["create", "--owner", "user-1", "--title", "Leilão Centro"],
    );
    assert!(success);
    let id = stdout.trim().to_string();
    assert_eq!(id.len(), 36, "expected a UUID, got {:?}", id);

    let (stdout, _, success) = run_dossier(&config_path, &["list", "--owner", "user-1"]);
    assert!(success);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("Leilão Centro"));

    let (stdout, _, success) = run_dossier(&config_path, &["list", "--owner", "someone-else"]);
    assert!(success);
    assert!(stdout.contains("No dossiers."));

    let (stdout, _, success) = run_dossier(&config_path, &["show", &id]);
    assert!(success);
    assert!(stdout.contains("generation:   pending"));
    assert!(stdout.contains("readiness:    empty"));
}

#[test]
fn test_show_missing_dossier() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);

    let (_, stderr, success) = run_dossier(&config_path, &["show", "does-not-exist"]);
    assert!(!success);
    assert!(stderr.contains("dossier not found"), "got: {}", stderr);
}

#[test]
fn test_callback_mirrors_generation_status() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);
    let id = create_dossier(&config_path);

    let (stdout, stderr, success) =
        run_dossier(&config_path, &["callback", &id, "edital", "processing"]);
    assert!(success, "callback failed: {}", stderr);
    assert!(stdout.contains("updated: 0"));

    let (stdout, _, _) = run_dossier(&config_path, &["show", &id]);
    assert!(stdout.contains("generation:   generating"));
}

#[test]
fn test_callback_rejects_unknown_status() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);
    let id = create_dossier(&config_path);

    let (_, stderr, success) = run_dossier(&config_path, &["callback", &id, "edital", "done"]);
    assert!(!success);
    assert!(stderr.contains("unknown callback status"), "got: {}", stderr);

    let (_, stderr, success) =
        run_dossier(&config_path, &["callback", &id, "escritura", "completed"]);
    assert!(!success);
    assert!(stderr.contains("unknown document type"), "got: {}", stderr);
}

#[test]
fn test_add_text_without_generation_pipeline() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);
    let id = create_dossier(&config_path);

    let (stdout, stderr, success) = run_dossier(
        &config_path,
        &[
            "add-text",
            "--dossier",
            &id,
            "--title",
            "Notas",
            "--content",
            "Lance mínimo R$ 150.000",
        ],
    );
    assert!(success, "add-text failed: {}", stderr);
    assert!(stdout.contains("processing"));
    assert!(stdout.contains("Processed: 1 succeeded"));
    // Text sources are not announced to the notifier
    assert!(stdout.contains("Notifications: 0 delivered, 0 retrying"));

    // Unreachable generation pipeline ends in failed
    let (stdout, _, _) = run_dossier(&config_path, &["show", &id]);
    assert!(stdout.contains("generation:   failed"));
    assert!(stdout.contains("1 uploaded, 0 processed"));
}

#[test]
fn test_add_urls_queues_notifications() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);
    let id = create_dossier(&config_path);

    let (stdout, stderr, success) = run_dossier(
        &config_path,
        &[
            "add-urls",
            "--dossier",
            &id,
            "--owner",
            "user-1",
            "--email",
            "user-1@example.com",
            "https://leiloes.example.com/lote/7",
        ],
    );
    assert!(success, "add-urls failed: {}", stderr);
    assert!(stdout.contains("Website 1: https://leiloes.example.com/lote/7"));
    assert!(stdout.contains("Notifications: 0 delivered, 1 retrying, 0 dead"));

    let (stdout, _, success) = run_dossier(&config_path, &["outbox", "list", "--state", "pending"]);
    assert!(success);
    assert!(stdout.contains("pending"));
    assert!(stdout.contains("notifier upstream error"));
}

#[test]
fn test_upload_requires_storage() {
    let (tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);
    let id = create_dossier(&config_path);

    let file = tmp.path().join("edital.pdf");
    fs::write(&file, b"%PDF-1.4").unwrap();

    let (_, stderr, success) = run_dossier(
        &config_path,
        &[
            "upload",
            "--dossier",
            &id,
            "--owner",
            "user-1",
            "--email",
            "a@b.c",
            file.to_str().unwrap(),
        ],
    );
    assert!(!success);
    assert!(stderr.contains("object storage is not configured"), "got: {}", stderr);
}

#[test]
fn test_analysis_before_ready() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);
    let id = create_dossier(&config_path);

    let (stdout, _, success) = run_dossier(&config_path, &["analysis", &id]);
    assert!(success);
    assert!(stdout.contains("Analysis still processing."));

    let (_, stderr, success) = run_dossier(&config_path, &["analysis", &id, "--start"]);
    assert!(!success);
    assert!(stderr.contains("not ready for analysis: empty"), "got: {}", stderr);
}

#[test]
fn test_chat_without_pipeline_is_upstream_error() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);
    let id = create_dossier(&config_path);

    let (_, stderr, success) = run_dossier(&config_path, &["chat", &id, "Qual o valor?"]);
    assert!(!success);
    assert!(stderr.contains("chat upstream error"), "got: {}", stderr);
}

#[test]
fn test_sweep_and_delete() {
    let (_tmp, config_path) = setup_test_env();
    run_dossier(&config_path, &["init"]);
    let id = create_dossier(&config_path);

    let (stdout, _, success) = run_dossier(&config_path, &["sweep"]);
    assert!(success);
    assert!(stdout.contains("Timed out 0 source(s)."));

    let (stdout, _, success) = run_dossier(&config_path, &["delete", &id]);
    assert!(success);
    assert!(stdout.contains("Deleted dossier"));

    let (_, _, success) = run_dossier(&config_path, &["delete", &id]);
    assert!(!success, "second delete should fail");
}

// ============ HTTP server ============

/// Find an available port for the test server.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start the server in the background, return the child process.
fn start_server(config_path: &Path, envs: &[(&str, &str)]) -> std::process::Child {
    let binary = dossier_binary();
    Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("serve")
        .envs(envs.iter().copied())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("Failed to start server: {}", e))
}

/// Wait for the server to be ready by polling the health endpoint.
fn wait_for_server(port: u16) {
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        std::thread::sleep(std::time::Duration::from_millis(100));
        if let Ok(resp) = reqwest::blocking::get(&url) {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

struct TestServer {
    _tmp: TempDir,
    child: std::process::Child,
    base: String,
    client: reqwest::blocking::Client,
}

impl TestServer {
    fn start(extra: &str, envs: &[(&str, &str)]) -> Self {
        let port = find_free_port();
        let (tmp, config_path) = setup_test_env_with(port, extra);
        run_dossier(&config_path, &["init"]);
        let child = start_server(&config_path, envs);
        wait_for_server(port);
        Self {
            _tmp: tmp,
            child,
            base: format!("http://127.0.0.1:{}", port),
            client: reqwest::blocking::Client::new(),
        }
    }

    fn post(&self, path: &str, body: serde_json::Value) -> reqwest::blocking::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .unwrap()
    }

    fn get(&self, path: &str) -> reqwest::blocking::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .unwrap()
    }

    fn create_dossier(&self) -> String {
        let resp = self.post("/dossiers", serde_json::json!({ "ownerId": "user-1" }));
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = resp.json().unwrap();
        body["id"].as_str().unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

#[test]
fn test_server_health() {
    let server = TestServer::start("", &[]);

    let resp = server.get("/health");
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[test]
fn test_server_dossier_detail() {
    let server = TestServer::start("", &[]);
    let id = server.create_dossier();

    let resp = server.get(&format!("/dossiers/{}", id));
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["generation_status"], "pending");
    assert_eq!(body["readiness"]["state"], "empty");
    assert!(body["sources"].as_array().unwrap().is_empty());

    let resp = server.get("/dossiers/unknown");
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[test]
fn test_server_callback_validation() {
    let server = TestServer::start("", &[]);
    let id = server.create_dossier();

    let resp = server.post(
        "/callbacks/document-status",
        serde_json::json!({ "dossierId": id, "documentType": "edital" }),
    );
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("status is required"));

    let resp = server.post(
        "/callbacks/document-status",
        serde_json::json!({ "dossierId": "missing", "documentType": "edital", "status": "completed" }),
    );
    assert_eq!(resp.status(), 404);

    // Wrongly typed field
    let resp = server.post(
        "/callbacks/document-status",
        serde_json::json!({ "dossierId": id, "documentType": "edital", "status": 5 }),
    );
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    // Body without a JSON content type
    let resp = server
        .client
        .post(format!("{}/callbacks/document-status", server.base))
        .body("not json")
        .send()
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = server.post(
        "/callbacks/document-status",
        serde_json::json!({ "notebookId": id, "documentType": "edital", "status": "completed" }),
    );
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert!(body["message"].is_string());
    assert!(body["updated"].as_array().unwrap().is_empty());

    let resp = server.get(&format!("/dossiers/{}", id));
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["generation_status"], "completed");
}

#[test]
fn test_server_callback_token() {
    let port = find_free_port();
    let (_tmp, config_path) = setup_test_env_with(port, "");
    // Rewrite [server] with a callback token variable
    let text = fs::read_to_string(&config_path).unwrap().replace(
        "[server]\n",
        "[server]\ncallback_token_env = \"DOSSIER_TEST_CALLBACK_TOKEN\"\n",
    );
    fs::write(&config_path, text).unwrap();
    run_dossier(&config_path, &["init"]);
    let mut child = start_server(&config_path, &[("DOSSIER_TEST_CALLBACK_TOKEN", "s3cret")]);
    wait_for_server(port);

    let client = reqwest::blocking::Client::new();
    let url = format!("http://127.0.0.1:{}/callbacks/document-status", port);
    let body = serde_json::json!({ "dossierId": "x", "documentType": "edital", "status": "completed" });

    let resp = client.post(&url).json(&body).send().unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(&url)
        .bearer_auth("s3cret")
        .json(&body)
        .send()
        .unwrap();
    assert_eq!(resp.status(), 404, "authorized request reaches the handler");

    child.kill().ok();
    child.wait().ok();
}

#[test]
fn test_server_text_source_and_analysis() {
    let server = TestServer::start("", &[]);
    let id = server.create_dossier();

    let resp = server.post(
        &format!("/dossiers/{}/sources/text", id),
        serde_json::json!({ "title": "Notas", "content": "Imóvel desocupado" }),
    );
    assert_eq!(resp.status(), 202);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["sources"][0]["processing_status"], "processing");
    assert_eq!(body["sources"][0]["source_type"], "text");

    let resp = server.post(&format!("/dossiers/{}/analysis/start", id), serde_json::json!({}));
    assert_eq!(resp.status(), 400, "one source still processing");

    let resp = server.get(&format!("/dossiers/{}/analysis", id));
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert!(body["results"].as_array().unwrap().is_empty());

    let resp = server.post(
        "/analysis-results",
        serde_json::json!({
            "dossierId": id,
            "checklistTopic": "Ocupação do imóvel",
            "summary": "Imóvel desocupado segundo o edital",
            "confidenceScore": 0.8
        }),
    );
    assert_eq!(resp.status(), 201);

    let resp = server.get(&format!("/dossiers/{}/analysis", id));
    let body: serde_json::Value = resp.json().unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["checklistTopic"], "Ocupação do imóvel");
}

#[test]
fn test_server_upstream_failures_are_502() {
    let server = TestServer::start("", &[]);
    let id = server.create_dossier();

    let resp = server.post(
        "/chat",
        serde_json::json!({ "dossierId": id, "message": "Há débitos de condomínio?" }),
    );
    assert_eq!(resp.status(), 502);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "upstream_error");

    let resp = server.post(
        "/upload-url",
        serde_json::json!({ "ownerId": "user-1", "filename": "a.pdf", "contentType": "application/pdf" }),
    );
    assert_eq!(resp.status(), 502);

    let resp = server.post("/chat", serde_json::json!({ "dossierId": id, "message": "  " }));
    assert_eq!(resp.status(), 400);
}

#[test]
fn test_server_outbox_listing() {
    let server = TestServer::start("", &[]);
    let id = server.create_dossier();

    let resp = server.post(
        &format!("/dossiers/{}/sources/websites", id),
        serde_json::json!({
            "ownerId": "user-1",
            "email": "user-1@example.com",
            "urls": ["https://leiloes.example.com/lote/9"]
        }),
    );
    assert_eq!(resp.status(), 202);

    // Notifications are queued by a background task
    let mut jobs = Vec::new();
    for _ in 0..20 {
        let body: serde_json::Value = server.get("/outbox?state=pending").json().unwrap();
        jobs = body["jobs"].as_array().unwrap().clone();
        if !jobs.is_empty() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["payload"]["correlation_id"], id.as_str());

    let resp = server.get("/outbox?state=bogus");
    assert_eq!(resp.status(), 400);

    let resp = server.post("/outbox/missing/retry", serde_json::json!({}));
    assert_eq!(resp.status(), 404);
}
