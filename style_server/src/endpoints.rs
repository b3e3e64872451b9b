//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    body::StreamBody,
    extract::{DefaultBodyLimit, Multipart},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;

use crate::driver::{AppState, DriverState};

/// Largest accepted style image upload.
const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Build the HTTP router with all endpoints.
pub fn router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/status", get(status))
        .route("/stream", get(stylized_stream))
        .route("/style", get(style_image))
        .route("/style/next", post(next_style))
        .route("/style/upload", post(upload_style))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(Extension(app))
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state: String,
    pub error: Option<String>,
    pub style_loading: bool,
    pub style_source: Option<String>,
    pub camera_connected: bool,
    pub viewers: usize,
    pub frames_rendered: u64,
}

impl StatusReport {
    pub fn of(app: &AppState) -> Self {
        let state = app.driver_state();
        let error = match &state {
            DriverState::Failed(reason) => Some(reason.clone()),
            _ => None,
        };

        Self {
            state: state.to_string(),
            error,
            style_loading: app.style.is_refreshing(),
            style_source: app
                .selection()
                .map(|selection| selection.active_source().to_string()),
            camera_connected: app.frames.has_frame(),
            viewers: app.render.viewer_count(),
            frames_rendered: app.render.rendered_count(),
        }
    }
}

pub async fn status(Extension(app): Extension<Arc<AppState>>) -> Json<StatusReport> {
    Json(StatusReport::of(&app))
}

/// Live stream of the render target.
pub async fn stylized_stream(Extension(app): Extension<Arc<AppState>>) -> impl IntoResponse {
    let (current, rx) = app.render.subscribe();
    log::info!("Viewer connected, {} watching", app.render.viewer_count());

    // Lagging viewers skip frames instead of ending the stream
    let stream = futures::stream::iter(current)
        .chain(BroadcastStream::new(rx).filter_map(|item| async move { item.ok() }))
        .map(Ok::<_, String>);

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body)
}

/// The active style image.
pub async fn style_image(Extension(app): Extension<Arc<AppState>>) -> Response {
    match app.selection().and_then(|selection| selection.display_jpeg()) {
        Some(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "style image not loaded yet").into_response(),
    }
}

/// Switch to the next gallery style.
pub async fn next_style(
    Extension(app): Extension<Arc<AppState>>,
) -> Result<Redirect, (StatusCode, String)> {
    let selection = app.selection().cloned().ok_or_else(not_ready)?;

    tokio::spawn(async move {
        if let Err(e) = selection.cycle().await {
            log::warn!("{e:#}");
        }
    });

    Ok(Redirect::to("/"))
}

/// Use an uploaded image (multipart field `file`) as style.
pub async fn upload_style(
    Extension(app): Extension<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Redirect, (StatusCode, String)> {
    let selection = app.selection().cloned().ok_or_else(not_ready)?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_owned();
        let bytes = field.bytes().await.map_err(bad_request)?;
        upload = Some((name, bytes));
        break;
    }

    if let Some((name, bytes)) = upload {
        tokio::spawn(async move {
            match selection.upload(name, bytes).await {
                Ok(_) => {}
                Err(e) => log::warn!("{e:#}"),
            }
        });
    }

    Ok(Redirect::to("/"))
}

/// Page with the stylized stream, the style image and the style controls.
pub async fn index(Extension(app): Extension<Arc<AppState>>) -> Html<String> {
    let report = StatusReport::of(&app);
    let opacity = if report.style_loading { "0.2" } else { "1" };
    let notice = match (&report.error, app.driver_state()) {
        (Some(error), _) => format!("<p class=\"error\">Failed to start: {}</p>", escape(error)),
        (None, DriverState::Running) => String::new(),
        (None, state) => format!("<p>Pipeline is {state}, reload to update.</p>"),
    };

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Neural Style Transfer</title>
    <style>
        body {{ background: #282c34; color: white; font-family: sans-serif; text-align: center; }}
        img {{ width: 300px; border-radius: 30px; margin: 30px; vertical-align: middle; }}
        .error {{ color: #ff6b6b; }}
    </style>
</head>
<body>
    <h1>Neural Style Transfer</h1>
    {notice}
    <div>
        <img src="/style?generation={generation}" style="opacity: {opacity}" alt="style image">
        <span>&#8594;</span>
        <img src="/stream" alt="stylized webcam stream">
    </div>
    <form action="/style/next" method="post">
        <button type="submit">Next style</button>
    </form>
    <form action="/style/upload" method="post" enctype="multipart/form-data">
        <input type="file" name="file" accept="image/*">
        <button type="submit">Upload style</button>
    </form>
</body>
</html>
"#,
        generation = app.style.generation(),
    ))
}

fn not_ready() -> (StatusCode, String) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "models are still loading".to_owned(),
    )
}

fn bad_request(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, err.to_string())
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod test {
    use crate::driver::FocusPolicy;

    use super::*;

    #[test]
    fn test_status_before_start() {
        let app = AppState::new((300, 225), FocusPolicy::Viewers);
        let report = StatusReport::of(&app);

        assert_eq!(report.state, "uninitialized");
        assert_eq!(report.error, None);
        assert_eq!(report.style_source, None);
        assert!(!report.camera_connected);
        assert_eq!(report.viewers, 0);
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("<b>&</b>"), "&lt;b&gt;&amp;&lt;/b&gt;");
    }

    #[tokio::test]
    async fn test_index_mentions_state() {
        let app = Arc::new(AppState::new((300, 225), FocusPolicy::Viewers));
        let Html(page) = index(Extension(app)).await;

        assert!(page.contains("Pipeline is uninitialized"));
        assert!(page.contains("/style/upload"));
    }
}
