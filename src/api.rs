use axum::{
    body::Body,
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::{header, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tokio::fs;

use crate::{
    config::UploadLimits,
    error::ApiError,
    input_store::{check_file_size, PartSource, SubmissionPart},
    AppState,
};

/// Streams multipart fields into submission parts. Parts carrying a filename
/// are files; a file is rejected as soon as it grows past the per-file limit.
pub struct MultipartSource {
    multipart: Multipart,
    limits: UploadLimits,
}

impl MultipartSource {
    pub fn new(multipart: Multipart, limits: UploadLimits) -> Self {
        Self { multipart, limits }
    }
}

impl PartSource for MultipartSource {
    async fn next_part(&mut self) -> Result<Option<SubmissionPart>, ApiError> {
        let Some(mut field) = self.multipart.next_field().await.map_err(multipart_error)? else {
            return Ok(None);
        };
        let name = field.name().unwrap_or_default().to_string();

        let Some(file_name) = field.file_name().map(str::to_string) else {
            let value = field.text().await.map_err(multipart_error)?;
            return Ok(Some(SubmissionPart::Text { name, value }));
        };
        let content_type = field.content_type().map(str::to_string);

        let mut data = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            data.extend_from_slice(&chunk);
            check_file_size(&self.limits, &file_name, data.len() as u64)?;
        }

        Ok(Some(SubmissionPart::File {
            name,
            file_name,
            content_type,
            data,
        }))
    }
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::PayloadTooLarge("Upload exceeds the request size limit.".to_string());
    }
    ApiError::bad_request(format!("Invalid form data: {}", err.body_text()))
}

fn file_response(filename: &str, content_type: &str, bytes: Vec<u8>) -> Response<Body> {
    let content_disposition = format!("attachment; filename=\"{filename}\"");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| {
            ApiError::Internal("Failed to build download response.".to_string()).into_response()
        })
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn limits(State(state): State<AppState>) -> Json<UploadLimits> {
    Json(state.config.jobs.limits)
}

pub async fn create_job(
    State(state): State<AppState>,
    Path(tool): Path<String>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut parts = MultipartSource::new(multipart, state.config.jobs.limits);
    let accepted = state.jobs.submit(&tool, &mut parts).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.jobs.status(&job_id).await?;
    Ok(([(header::CACHE_CONTROL, "no-store")], Json(status)))
}

pub async fn download_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let download = state.jobs.download(&job_id).await?;

    let bytes = match fs::read(&download.path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found("Job output no longer exists."));
        }
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("Failed to read {}", download.path.display()))
                .into());
        }
    };

    Ok(file_response(&download.filename, &download.content_type, bytes))
}

/// Runs a tool inline and answers with its output instead of a job id.
pub async fn run_tool(
    State(state): State<AppState>,
    Path(tool): Path<String>,
    multipart: Multipart,
) -> Result<Response<Body>, ApiError> {
    let mut parts = MultipartSource::new(multipart, state.config.jobs.limits);
    let (output, bytes) = state
        .jobs
        .run_now(&tool, &mut parts, state.config.request_timeout)
        .await?;
    Ok(file_response(&output.filename, &output.content_type, bytes))
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, path::Path as FsPath, sync::Arc, time::Duration};

    use axum::{body::to_bytes, http::Request, Router};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::{
        build_router,
        config::{Config, JobSettings},
        service::{JobService, JobWorkers},
        tools::{testing::{page_count_of, sample_pdf}, ToolDispatch},
        AppState,
    };

    const BOUNDARY: &str = "pdf-workbench-test-boundary";

    enum Part {
        Text(&'static str, &'static str),
        File(&'static str, &'static str, Vec<u8>),
    }

    fn app(root: &FsPath) -> (Router, JobWorkers) {
        let jobs = JobSettings {
            job_root: root.join("jobs"),
            timeout: Duration::from_secs(10),
            retention: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(3600),
            tmp_root: root.join("tmp"),
            tmp_ttl: Duration::from_secs(600),
            limits: super::UploadLimits::default(),
            libreoffice_cmd: None,
        };
        let (service, workers) = JobService::start(jobs.clone(), Arc::new(ToolDispatch));
        let state = AppState {
            config: Config {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                request_timeout: Duration::from_secs(10),
                jobs,
            },
            jobs: service,
        };
        (build_router(state), workers)
    }

    fn multipart_request(uri: &str, parts: Vec<Part>) -> Request<axum::body::Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                            .as_bytes(),
                    );
                }
                Part::File(name, file_name, data) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/pdf\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(&data);
                    body.extend_from_slice(b"\r\n");
                }
            }
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                super::header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(axum::body::Body::from(body))
            .expect("request")
    }

    fn get(uri: &str) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .body(axum::body::Body::empty())
            .expect("request")
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_and_limits_respond() {
        let root = tempfile::tempdir().expect("tempdir");
        let (router, workers) = app(root.path());

        let response = router.clone().oneshot(get("/healthz")).await.expect("healthz");
        assert_eq!(response.status(), super::StatusCode::OK);
        assert_eq!(json_body(response).await["ok"], true);

        let response = router.oneshot(get("/api/limits")).await.expect("limits");
        let body = json_body(response).await;
        assert_eq!(body["maxFiles"], 20);
        assert_eq!(body["maxPages"], 500);
        workers.stop().await;
    }

    #[tokio::test]
    async fn unknown_tools_and_jobs_are_not_found() {
        let root = tempfile::tempdir().expect("tempdir");
        let (router, workers) = app(root.path());

        let request = multipart_request(
            "/api/jobs/not-a-tool",
            vec![Part::File("file", "a.pdf", sample_pdf(1))],
        );
        let response = router.clone().oneshot(request).await.expect("submit");
        assert_eq!(response.status(), super::StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert_eq!(body["error"]["message"], "Unsupported tool \"not-a-tool\".");

        let response = router.oneshot(get("/api/jobs/nope")).await.expect("status");
        assert_eq!(response.status(), super::StatusCode::NOT_FOUND);
        workers.stop().await;
    }

    #[tokio::test]
    async fn merge_job_round_trip_over_http() {
        let root = tempfile::tempdir().expect("tempdir");
        let (router, workers) = app(root.path());

        let request = multipart_request(
            "/api/jobs/merge-pdf",
            vec![
                Part::File("files", "a.pdf", sample_pdf(1)),
                Part::File("files", "b.pdf", sample_pdf(1)),
            ],
        );
        let response = router.clone().oneshot(request).await.expect("submit");
        assert_eq!(response.status(), super::StatusCode::ACCEPTED);
        let job_id = json_body(response).await["jobId"]
            .as_str()
            .expect("job id")
            .to_string();

        let mut status = Value::Null;
        for _ in 0..500 {
            let response = router
                .clone()
                .oneshot(get(&format!("/api/jobs/{job_id}")))
                .await
                .expect("status");
            assert_eq!(response.headers()[super::header::CACHE_CONTROL], "no-store");
            status = json_body(response).await;
            if status["status"] == "done" || status["status"] == "error" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status["status"], "done", "{status}");
        assert_eq!(status["tool"], "merge-pdf");
        let url = status["downloadUrl"].as_str().expect("download url").to_string();

        let response = router.oneshot(get(&url)).await.expect("download");
        assert_eq!(response.status(), super::StatusCode::OK);
        assert_eq!(response.headers()[super::header::CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[super::header::CONTENT_DISPOSITION],
            "attachment; filename=\"merged.pdf\""
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert_eq!(page_count_of(&bytes), 2);
        workers.stop().await;
    }

    #[tokio::test]
    async fn synchronous_tool_returns_the_file() {
        let root = tempfile::tempdir().expect("tempdir");
        let (router, workers) = app(root.path());

        let request = multipart_request(
            "/api/tools/rotate-pdf",
            vec![
                Part::File("file", "doc.pdf", sample_pdf(2)),
                Part::Text("angle", "270"),
                Part::Text("pages", "2"),
            ],
        );
        let response = router.clone().oneshot(request).await.expect("run");
        assert_eq!(response.status(), super::StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert_eq!(page_count_of(&bytes), 2);

        let request = multipart_request(
            "/api/tools/rotate-pdf",
            vec![Part::File("file", "doc.pdf", sample_pdf(1)), Part::Text("angle", "45")],
        );
        let response = router.oneshot(request).await.expect("run");
        assert_eq!(response.status(), super::StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], "INVALID_REQUEST");
        workers.stop().await;
    }
}
