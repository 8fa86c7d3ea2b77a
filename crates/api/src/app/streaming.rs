//! Newline-delimited JSON bodies for heartbeat-framed streams.

use std::fmt::Display;
use std::io;

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::warn;

use aeon_infra::streaming::Frame;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// The line written for `Frame::Heartbeat`.
pub const HEARTBEAT_LINE: &str = "{\"name\":\"heartbeat\"}\n";

/// Render frames as ndjson, one value per line.
///
/// A stream error aborts the body, so the client sees a truncated response
/// instead of a clean end.
pub fn ndjson<S, T, E>(frames: S) -> Response
where
    S: Stream<Item = Result<Frame<T>, E>> + Send + 'static,
    T: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    let lines = frames.map(|frame| -> io::Result<Vec<u8>> {
        match frame {
            Ok(Frame::Heartbeat) => Ok(HEARTBEAT_LINE.as_bytes().to_vec()),
            Ok(Frame::Item(item)) => {
                let mut line = serde_json::to_vec(&item).map_err(io::Error::other)?;
                line.push(b'\n');
                Ok(line)
            }
            Err(err) => {
                warn!(error = %err, "aborting stream");
                Err(io::Error::other(err.to_string()))
            }
        }
    });

    (
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(lines),
    )
        .into_response()
}
