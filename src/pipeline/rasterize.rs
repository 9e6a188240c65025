//! SVG icon handling for the build pipeline.
//!
//! The TWA generator only accepts raster icons, so SVG sources are rendered
//! to a 512x512 PNG up front and served to the generator from a short-lived
//! loopback HTTP server that lives exactly as long as the generation stage.

use axum::Router;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use resvg::{tiny_skia, usvg};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::errors::PipelineError;

/// Output edge length for rasterized icons.
pub const ICON_SIZE: u32 = 512;

/// Render SVG bytes to a PNG, scaled to fit [`ICON_SIZE`] while preserving
/// aspect ratio.
pub fn rasterize_svg(data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    let tree = usvg::Tree::from_data(data, &usvg::Options::default())
        .map_err(|e| PipelineError::Rasterize(e.to_string()))?;

    let size = tree.size();
    if size.width() <= 0.0 || size.height() <= 0.0 {
        return Err(PipelineError::Rasterize("SVG has no drawable area".to_string()));
    }
    let scale = (ICON_SIZE as f32 / size.width()).min(ICON_SIZE as f32 / size.height());

    let mut pixmap = tiny_skia::Pixmap::new(ICON_SIZE, ICON_SIZE)
        .ok_or_else(|| PipelineError::Rasterize("could not allocate pixmap".to_string()))?;
    resvg::render(
        &tree,
        tiny_skia::Transform::from_scale(scale, scale),
        &mut pixmap.as_mut(),
    );

    pixmap
        .encode_png()
        .map_err(|e| PipelineError::Rasterize(e.to_string()))
}

/// Serves a single rasterized icon at `/icon.png` on a loopback port.
///
/// Shuts the server down on drop, so holding the value is what keeps the
/// icon reachable.
pub struct IconServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl IconServer {
    pub async fn start(png: Vec<u8>) -> Result<Self, PipelineError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let app = Router::new().route(
            "/icon.png",
            get(move || {
                let body = png.clone();
                async move { ([(header::CONTENT_TYPE, "image/png")], body).into_response() }
            }),
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                eprintln!("[pipeline] icon server error: {}", e);
            }
        });

        Ok(Self {
            url: format!("http://{}/icon.png", addr),
            shutdown: Some(shutdown_tx),
        })
    }

    /// URL the generator can fetch the icon from.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for IconServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SVG: &str = concat!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="64" height="64">"#,
        r##"<rect width="64" height="64" fill="#336699"/></svg>"##
    );

    #[test]
    fn rasterizes_svg_to_png() {
        let png = rasterize_svg(SAMPLE_SVG.as_bytes()).unwrap();
        // PNG signature
        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[test]
    fn rejects_garbage_input() {
        let err = rasterize_svg(b"this is not an svg").unwrap_err();
        assert!(matches!(err, PipelineError::Rasterize(_)));
    }

    #[tokio::test]
    async fn icon_server_serves_the_png() {
        let png = rasterize_svg(SAMPLE_SVG.as_bytes()).unwrap();
        let server = match IconServer::start(png.clone()).await {
            Ok(server) => server,
            // Sandboxed environments may refuse loopback binds.
            Err(_) => return,
        };
        assert!(server.url().starts_with("http://127.0.0.1:"));
        assert!(server.url().ends_with("/icon.png"));

        let fetched = reqwest::get(server.url()).await.unwrap();
        assert_eq!(
            fetched.headers().get("content-type").unwrap(),
            "image/png"
        );
        let body = fetched.bytes().await.unwrap();
        assert_eq!(body.as_ref(), png.as_slice());
    }
}
