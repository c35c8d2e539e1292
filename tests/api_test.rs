use std::io::Cursor;
use std::sync::Arc;

use image::{DynamicImage, GenericImageView, ImageFormat};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_json::{json, Value};

use image_job_pipeline::app_state::AppState;
use image_job_pipeline::routes::api_router;
use image_job_pipeline::services::memory_queue::MemoryQueue;
use image_job_pipeline::services::memory_store::MemoryJobStore;
use image_job_pipeline::services::processors::ProcessorRegistry;
use image_job_pipeline::services::queue::QueueConfig;

struct TestServer {
    base_url: String,
    queue: Arc<MemoryQueue>,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as the server binary, with in-memory backends.
        let queue = Arc::new(MemoryQueue::new(QueueConfig::default()));
        let state = AppState::new(
            Arc::new(MemoryJobStore::new()),
            queue.clone(),
            Arc::new(ProcessorRegistry::with_defaults()),
        );
        let app = api_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            queue,
            client: reqwest::Client::new(),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn submit(&self, body: Value) -> reqwest::Response {
        self.client
            .post(self.url("/api/v1/jobs"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

impl TestServer {
    async fn transform(&self, path_and_query: &str, form: Form) -> reqwest::Response {
        self.client
            .post(self.url(path_and_query))
            .multipart(form)
            .send()
            .await
            .unwrap()
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::new_rgba8(width, height)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

fn upload(bytes: Vec<u8>) -> Form {
    Form::new().part(
        "image",
        Part::bytes(bytes)
            .file_name("source.png")
            .mime_str("image/png")
            .unwrap(),
    )
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn crop_body(width: i64) -> Value {
    json!({
        "type": "crop",
        "parameters": {"x": 10, "y": 10, "width": width, "height": 50},
        "input": {"storage_key": "uploads/in.png", "mime_type": "image/png", "size": 1024}
    })
}

#[tokio::test]
async fn test_submit_and_fetch_job() {
    let server = TestServer::spawn().await;

    let res = server
        .client
        .post(server.url("/api/v1/jobs"))
        .header("x-request-id", "req-abc")
        .json(&crop_body(50))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "queued");
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert_eq!(server.queue.pending_count(), 1);

    let res = server
        .client
        .get(server.url(&format!("/api/v1/jobs/{}", job_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let job: Value = res.json().await.unwrap();
    assert_eq!(job["job_id"], job_id.as_str());
    assert_eq!(job["type"], "crop");
    assert_eq!(job["status"], "queued");
    assert_eq!(job["parameters"]["width"], 50);
    assert_eq!(job["input"]["storage_key"], "uploads/in.png");
    assert_eq!(job["metadata"]["request_id"], "req-abc");
    assert_eq!(job["metadata"]["retry_count"], 0);
}

#[tokio::test]
async fn test_invalid_parameters_are_rejected() {
    let server = TestServer::spawn().await;

    let res = server.submit(crop_body(0)).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_failed");
    assert!(!body["message"].as_str().unwrap().is_empty());
    assert_eq!(server.queue.pending_count(), 0);
}

#[tokio::test]
async fn test_unknown_job_type_is_rejected() {
    let server = TestServer::spawn().await;

    let res = server
        .submit(json!({
            "type": "blur",
            "parameters": {"radius": 3},
            "input": {"storage_key": "k", "mime_type": "image/png", "size": 1}
        }))
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "bad_request");
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let server = TestServer::spawn().await;

    let res = server
        .client
        .get(server.url("/api/v1/jobs/unknown-id"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "job_not_found");
}

#[tokio::test]
async fn test_list_and_delete_jobs() {
    let server = TestServer::spawn().await;
    for _ in 0..3 {
        assert_eq!(server.submit(crop_body(20)).await.status(), StatusCode::ACCEPTED);
    }

    let res = server
        .client
        .get(server.url("/api/v1/jobs?status=queued&type=crop&limit=2"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["count"], 2);
    let first = body["jobs"][0]["job_id"].as_str().unwrap().to_string();

    let res = server
        .client
        .get(server.url("/api/v1/jobs?status=completed"))
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["count"], 0);

    let res = server
        .client
        .delete(server.url(&format!("/api/v1/jobs/{}", first)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = server
        .client
        .delete(server.url(&format!("/api/v1/jobs/{}", first)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let body: Value = server
        .client
        .get(server.url("/api/v1/jobs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 2);
}

#[tokio::test]
async fn test_invalid_status_filter_is_rejected() {
    let server = TestServer::spawn().await;
    let res = server
        .client
        .get(server.url("/api/v1/jobs?status=archived"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_processors() {
    let server = TestServer::spawn().await;
    let body: Value = server
        .client
        .get(server.url("/api/v1/processors"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["processors"], json!(["crop", "resize"]));
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::spawn().await;
    let res = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["store"]["status"], "ok");
    assert_eq!(body["checks"]["queue"]["status"], "ok");
}

#[tokio::test]
async fn test_crop_returns_transformed_image() {
    let server = TestServer::spawn().await;
    let res = server
        .transform(
            "/api/v1/crop?x=10&y=10&width=50&height=40",
            upload(png(200, 200)),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "image/jpeg");

    let body = res.bytes().await.unwrap();
    let image = image::load_from_memory_with_format(&body, ImageFormat::Jpeg).unwrap();
    assert_eq!(image.dimensions(), (50, 40));
    assert_eq!(server.queue.pending_count(), 0);
}

#[tokio::test]
async fn test_resize_returns_transformed_image() {
    let server = TestServer::spawn().await;
    let res = server
        .transform("/api/v1/resize?width=64&height=32", upload(png(200, 100)))
        .await;
    assert_eq!(res.status(), StatusCode::OK);

    let body = res.bytes().await.unwrap();
    let image = image::load_from_memory(&body).unwrap();
    assert_eq!(image.dimensions(), (64, 32));
}

#[tokio::test]
async fn test_crop_outside_image_is_rejected() {
    let server = TestServer::spawn().await;
    let res = server
        .transform(
            "/api/v1/crop?x=150&y=150&width=100&height=100",
            upload(png(200, 200)),
        )
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_failed");
}

#[tokio::test]
async fn test_transform_rejects_bad_requests() {
    let server = TestServer::spawn().await;

    let res = server
        .transform("/api/v1/resize?width=0&height=10", upload(png(20, 20)))
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_failed");

    let res = server
        .transform("/api/v1/resize?width=abc&height=10", upload(png(20, 20)))
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "bad_request");

    let res = server
        .transform(
            "/api/v1/resize?width=10&height=10",
            Form::new().text("note", "no file here"),
        )
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["message"], "No image file provided");

    let res = server
        .transform(
            "/api/v1/resize?width=10&height=10",
            upload(b"not an image".to_vec()),
        )
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Invalid image format"));
}
