//! API routes

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, AppState};
use crate::handlers::{campaigns, health, imports, jobs};

/// Create the API router
pub fn create_router(state: AppState, max_upload_bytes: usize) -> Router {
    let state = Arc::new(state);

    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness))
        .route("/detailed", get(health::health_detailed))
        .with_state(state.clone());

    // Campaign routes
    let campaign_routes = Router::new()
        .route("/", post(campaigns::create_campaign))
        .route(
            "/:campaign_id",
            get(campaigns::get_campaign).delete(campaigns::delete_campaign),
        )
        .route("/:campaign_id/results", get(campaigns::get_campaign_results))
        .route("/:campaign_id/launch", post(campaigns::launch_campaign))
        .route("/:campaign_id/complete", post(campaigns::complete_campaign));

    // Bulk import routes
    let import_routes = Router::new()
        .route("/upload", post(imports::upload_import))
        .route("/commit", post(imports::commit_import))
        .layer(DefaultBodyLimit::max(max_upload_bytes));

    // Job routes
    let job_routes = Router::new()
        .route("/", get(jobs::list_jobs))
        .route("/:job_id", get(jobs::get_job))
        .route("/:job_id/cancel", post(jobs::cancel_job));

    // API v1 routes with authentication
    let api_v1 = Router::new()
        .nest("/campaigns", campaign_routes)
        .route("/test-send", post(campaigns::send_test_email))
        .route("/templates/validate", post(campaigns::validate_template))
        .nest("/imports", import_routes)
        .nest("/jobs", job_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state);

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_api_key;
    use async_trait::async_trait;
    use axum::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
    use axum_test::multipart::{MultipartForm, Part};
    use axum_test::{TestRequest, TestServer};
    use chrono::Utc;
    use hookline_common::config::{ApiKeyConfig, ImportConfig};
    use hookline_common::types::Recipient;
    use hookline_core::jobs::JobManager;
    use hookline_core::scheduled::{
        DeliveryResult, EmailMessage, MailTransport, RedirectCipher, SmsMessage, SmsTransport,
    };
    use hookline_core::{BulkImporter, CampaignManager, DeliveryWorker};
    use hookline_storage::models::{SendingProfile, SmsProfile};
    use hookline_storage::repository::GroupStore;
    use hookline_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    const KEY: &str = "hl_test_key";
    const OTHER_KEY: &str = "hl_other_key";

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl MailTransport for RecordingMailer {
        async fn send_batch(
            &self,
            _profile: &SendingProfile,
            messages: Vec<EmailMessage>,
        ) -> Vec<DeliveryResult> {
            let results = messages
                .iter()
                .map(|m| DeliveryResult::Sent {
                    message_id: format!("<{}@test>", m.r_id),
                })
                .collect();
            self.sent.lock().unwrap().extend(messages);
            results
        }
    }

    struct NoSms;

    #[async_trait]
    impl SmsTransport for NoSms {
        async fn send_batch(
            &self,
            _profile: &SmsProfile,
            messages: Vec<SmsMessage>,
        ) -> Vec<DeliveryResult> {
            messages
                .iter()
                .map(|_| DeliveryResult::PermanentFailure {
                    error: "sms disabled".to_string(),
                })
                .collect()
        }
    }

    struct TestApp {
        server: TestServer,
        store: Arc<MemoryStore>,
        mailer: Arc<RecordingMailer>,
        user_id: Uuid,
        _dir: TempDir,
    }

    impl TestApp {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(MemoryStore::new());
            let mailer = Arc::new(RecordingMailer::default());
            let user_id = Uuid::new_v4();
            let cipher = RedirectCipher::new(&[7u8; 32]).unwrap();

            let worker = DeliveryWorker::new(
                store.clone(),
                store.clone(),
                mailer.clone(),
                Arc::new(NoSms),
                cipher.clone(),
            );
            let importer = BulkImporter::new(
                store.clone(),
                Arc::new(JobManager::new()),
                ImportConfig {
                    yield_ms: 0,
                    upload_dir: dir.path().to_path_buf(),
                    ..Default::default()
                },
            );

            let state = AppState {
                campaigns: Arc::new(CampaignManager::new(store.clone(), store.clone(), cipher)),
                store: store.clone(),
                worker: Arc::new(worker),
                importer: Arc::new(importer),
                api_keys: vec![
                    ApiKeyConfig {
                        name: "ops".to_string(),
                        key_hash: hash_api_key(KEY),
                        user_id,
                    },
                    ApiKeyConfig {
                        name: "other".to_string(),
                        key_hash: hash_api_key(OTHER_KEY),
                        user_id: Uuid::new_v4(),
                    },
                ],
                db_pool: None,
            };

            store
                .insert_template(
                    user_id,
                    "Invoice",
                    "Invoice for {{.FirstName}}",
                    "",
                    "<p>Hi {{.FirstName}}, see {{.URL}}</p>",
                )
                .await;
            store
                .insert_sending_profile(SendingProfile {
                    id: Uuid::new_v4(),
                    user_id,
                    name: "relay".to_string(),
                    host: "smtp.example.net".to_string(),
                    port: 25,
                    username: None,
                    password: None,
                    from_address: "Billing <billing@example.net>".to_string(),
                    ignore_cert_errors: false,
                    headers: json!({}),
                    modified_date: Utc::now(),
                })
                .await;
            store
                .insert_group(
                    user_id,
                    "Finance",
                    &[
                        Recipient::new("ann@corp.example").with_name("Ann", "Lee"),
                        Recipient::new("bo@corp.example").with_name("Bo", "Kim"),
                    ],
                )
                .await
                .unwrap();

            Self {
                server: TestServer::new(create_router(state, 1024 * 1024)).unwrap(),
                store,
                mailer,
                user_id,
                _dir: dir,
            }
        }

        fn authed(&self, request: TestRequest, key: &str) -> TestRequest {
            request.add_header(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key)).unwrap(),
            )
        }

        fn get(&self, path: &str) -> TestRequest {
            self.authed(self.server.get(path), KEY)
        }

        fn post(&self, path: &str) -> TestRequest {
            self.authed(self.server.post(path), KEY)
        }

        async fn create_campaign(&self) -> Uuid {
            let response = self
                .post("/api/v1/campaigns")
                .json(&json!({
                    "name": "Q3 Invoice",
                    "template": "Invoice",
                    "smtp": "relay",
                    "groups": ["Finance"],
                    "url": "https://lure.example",
                }))
                .await;
            response.assert_status(StatusCode::CREATED);
            let id = response.json::<Value>()["id"].as_str().unwrap().to_string();
            id.parse().unwrap()
        }

        async fn upload(&self, csv: &str) -> axum_test::TestResponse {
            let form = MultipartForm::new().add_part(
                "file",
                Part::bytes(csv.as_bytes().to_vec())
                    .file_name("targets.csv")
                    .mime_type("text/csv"),
            );
            self.post("/api/v1/imports/upload").multipart(form).await
        }

        async fn wait_for_sent(&self, count: usize) {
            for _ in 0..200 {
                if self.mailer.sent.lock().unwrap().len() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(self.mailer.sent.lock().unwrap().len(), count);
        }

        async fn wait_for_job(&self, job_id: &str) -> Value {
            for _ in 0..200 {
                let job = self.get(&format!("/api/v1/jobs/{}", job_id)).await.json::<Value>();
                if job["status"] != "pending" && job["status"] != "processing" {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("job {} did not finish", job_id);
        }
    }

    #[tokio::test]
    async fn test_health_needs_no_key() {
        let app = TestApp::new().await;

        let response = app.server.get("/health").await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["status"], "healthy");

        app.server.get("/health/ready").await.assert_status_ok();
        let detailed = app.server.get("/health/detailed").await.json::<Value>();
        assert_eq!(detailed["database"], "memory");
    }

    #[tokio::test]
    async fn test_api_requires_known_key() {
        let app = TestApp::new().await;

        app.server
            .get("/api/v1/jobs")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
        app.authed(app.server.get("/api/v1/jobs"), "hl_wrong_key")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
        app.get("/api/v1/jobs").await.assert_status_ok();
    }

    #[tokio::test]
    async fn test_campaign_lifecycle() {
        let app = TestApp::new().await;
        let id = app.create_campaign().await;

        let campaign = app.get(&format!("/api/v1/campaigns/{}", id)).await.json::<Value>();
        assert_eq!(campaign["name"], "Q3 Invoice");

        let results = app
            .get(&format!("/api/v1/campaigns/{}/results", id))
            .await
            .json::<Value>();
        assert_eq!(results["results"].as_array().unwrap().len(), 2);

        // Starts now, so creating it is enough to send
        app.wait_for_sent(2).await;

        app.post(&format!("/api/v1/campaigns/{}/launch", id))
            .await
            .assert_status(StatusCode::ACCEPTED);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(app.mailer.sent.lock().unwrap().len(), 2);
        let results = app
            .get(&format!("/api/v1/campaigns/{}/results", id))
            .await
            .json::<Value>();
        assert!(results["results"]
            .as_array()
            .unwrap()
            .iter()
            .all(|r| r["status"] == "sent"));

        let completed = app
            .post(&format!("/api/v1/campaigns/{}/complete", id))
            .await
            .json::<Value>();
        assert!(completed["completed_date"].is_string());

        app.authed(app.server.delete(&format!("/api/v1/campaigns/{}", id)), KEY)
            .await
            .assert_status(StatusCode::NO_CONTENT);
        app.get(&format!("/api/v1/campaigns/{}", id))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_double_launch_sends_once() {
        let app = TestApp::new().await;
        let id = app.create_campaign().await;
        let launch = format!("/api/v1/campaigns/{}/launch", id);

        let (first, second) = tokio::join!(
            async { app.post(&launch).await },
            async { app.post(&launch).await }
        );
        first.assert_status(StatusCode::ACCEPTED);
        second.assert_status(StatusCode::ACCEPTED);

        app.wait_for_sent(2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut sent: Vec<String> =
            app.mailer.sent.lock().unwrap().iter().map(|m| m.to.clone()).collect();
        sent.sort();
        assert_eq!(sent.len(), 2);
        sent.dedup();
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn test_campaigns_are_scoped_to_key_owner() {
        let app = TestApp::new().await;
        let id = app.create_campaign().await;

        app.authed(app.server.get(&format!("/api/v1/campaigns/{}", id)), OTHER_KEY)
            .await
            .assert_status(StatusCode::NOT_FOUND);
        app.authed(app.server.post(&format!("/api/v1/campaigns/{}/launch", id)), OTHER_KEY)
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_campaign_validation() {
        let app = TestApp::new().await;

        let response = app
            .post("/api/v1/campaigns")
            .json(&json!({
                "name": "No groups",
                "template": "Invoice",
                "smtp": "relay",
                "url": "https://lure.example",
            }))
            .await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        let body = response.json::<Value>();
        assert_eq!(body["error"], "VALIDATION_ERROR");
        assert_eq!(body["message"], "No groups specified");

        let response = app
            .post("/api/v1/templates/validate")
            .json(&json!({ "text": "{{.Nope}}" }))
            .await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        app.post("/api/v1/templates/validate")
            .json(&json!({ "text": "Hello {{.FirstName}}" }))
            .await
            .assert_status(StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_send_test_email() {
        let app = TestApp::new().await;

        let response = app
            .post("/api/v1/test-send")
            .json(&json!({
                "template": "Invoice",
                "smtp": "relay",
                "url": "https://lure.example",
                "email": "qa@corp.example",
                "first_name": "Quinn",
            }))
            .await;
        response.assert_status_ok();
        let body = response.json::<Value>();
        assert!(body["message_id"].as_str().unwrap().starts_with("<preview-"));

        let sent = app.mailer.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Invoice for Quinn");

        app.post("/api/v1/test-send")
            .json(&json!({
                "template": "Missing",
                "smtp": "relay",
                "url": "https://lure.example",
                "email": "qa@corp.example",
            }))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_import_upload_and_commit() {
        let app = TestApp::new().await;

        let csv = "First Name,Last Name,Email\nCy,Park,cy@corp.example\nDee,Ray,dee@corp.example\n";
        let upload = app.upload(csv).await;
        upload.assert_status_ok();
        let upload = upload.json::<Value>();
        assert_eq!(upload["total_count"], 2);
        assert_eq!(upload["message"], "File uploaded. 2 records found.");
        assert_eq!(upload["preview"][0]["first_name"], "Cy");

        let commit = app
            .post("/api/v1/imports/commit")
            .json(&json!({
                "name": "Engineering",
                "group_type": "department",
                "file_token": upload["file_token"],
            }))
            .await;
        commit.assert_status(StatusCode::ACCEPTED);
        let commit = commit.json::<Value>();
        let job_id = commit["job_id"].as_str().unwrap().to_string();

        let job = app.wait_for_job(&job_id).await;
        assert_eq!(job["status"], "completed");
        assert_eq!(job["type"], "import");

        let group_id: Uuid = commit["group_id"].as_str().unwrap().parse().unwrap();
        assert_eq!(app.store.list_targets(group_id).await.unwrap().len(), 2);
        let group = app.store.get_group(group_id).await.unwrap().unwrap();
        assert_eq!(group.user_id, app.user_id);
        assert!(group.is_active);

        let cancel = app
            .post(&format!("/api/v1/jobs/{}/cancel", job_id))
            .await
            .json::<Value>();
        assert_eq!(cancel["success"], false);

        let jobs = app.get("/api/v1/jobs").await.json::<Value>();
        assert_eq!(jobs["data"].as_array().unwrap().len(), 1);
        let active = app.get("/api/v1/jobs?active=true").await.json::<Value>();
        assert!(active["data"].as_array().unwrap().is_empty());

        app.authed(app.server.get(&format!("/api/v1/jobs/{}", job_id)), OTHER_KEY)
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_import_rejections() {
        let app = TestApp::new().await;

        let response = app.upload("Name,Phone\nCy,555\n").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(
            response.json::<Value>()["message"],
            "CSV missing required 'Email' column"
        );

        let response = app
            .post("/api/v1/imports/commit")
            .json(&json!({ "file_token": "" }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        let response = app
            .post("/api/v1/imports/commit")
            .json(&json!({ "file_token": "expiredtoken0000" }))
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
        assert_eq!(
            response.json::<Value>()["message"],
            "Import file expired or not found"
        );
    }
}
