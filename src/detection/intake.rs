use chrono::Utc;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{DetectionEvent, DetectionLine, EventError};

/// Reads newline-delimited detections and forwards the valid ones.
/// Returns when the input ends, the receiver is dropped, or shutdown is requested.
pub async fn read_events<R>(
    reader: R,
    queue: mpsc::Sender<DetectionEvent>,
    shutdown: CancellationToken,
) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Intake stopping for shutdown");
                break;
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Detector input closed");
                break;
            }
            Err(e) => {
                warn!("Detector input unreadable: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        trace!(contents=%line, "Detector line");
        match load_event(&line).await {
            Ok(event) => {
                if queue.send(event).await.is_err() {
                    debug!("Pipeline closed, intake stopping");
                    break;
                }
                forwarded += 1;
            }
            Err(e) => warn!("Rejected detection: {}", e),
        }
    }
    forwarded
}

async fn load_event(line: &str) -> Result<DetectionEvent, EventError> {
    let parsed = DetectionLine::parse(line)?;
    let image = tokio::fs::read(&parsed.image_path).await.map_err(|e| {
        EventError::ImageUnreadable(parsed.image_path.display().to_string(), e.to_string())
    })?;
    let event = parsed.into_event(image, Utc::now());
    event.validate()?;
    Ok(event)
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::read_events;

    #[tokio::test]
    async fn test_forwards_valid_lines_only() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("crop.jpeg");
        std::fs::write(&image, b"\xff\xd8\xff").unwrap();
        let empty = dir.path().join("empty.jpeg");
        std::fs::write(&empty, b"").unwrap();

        let line = |camera: &str, path: &std::path::Path| {
            format!(
                r#"{{"object_type": "person", "confidence": 0.9, "bbox": {{"x1": 0, "y1": 0, "x2": 5, "y2": 5}}, "camera_id": "{}", "latitude": 1.0, "longitude": 2.0, "image_path": {:?}}}"#,
                camera, path
            )
        };
        let input = [
            line("cam_01", &image),
            "{garbage".to_string(),
            String::new(),
            line("cam_02", &dir.path().join("missing.jpeg")),
            line("cam_03", &empty),
            line("", &image),
            line("cam_04", &image),
        ]
        .join("\n");

        let (tx, mut rx) = mpsc::channel(10);
        let forwarded = read_events(input.as_bytes(), tx, CancellationToken::new()).await;
        assert_eq!(forwarded, 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.camera_id, "cam_01");
        assert_eq!(first.image, vec![0xff, 0xd8, 0xff]);
        assert_eq!(rx.recv().await.unwrap().camera_id, "cam_04");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let (_writer, reader) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let forwarded = read_events(tokio::io::BufReader::new(reader), tx, shutdown).await;
        assert_eq!(forwarded, 0);
    }
}
