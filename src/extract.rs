use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::process::Command;
use tracing::debug;

use crate::error::ScanError;

/// Outcome of pulling a subtitle track out of a video container.
#[derive(Debug)]
pub enum Extraction {
    /// SubRip file on disk; deleted when dropped.
    Track(TempPath),
    NoTrack,
    ToolUnavailable,
}

#[async_trait]
pub trait SubtitleExtractor: Send + Sync {
    async fn extract(&self, video: &Path) -> Result<Extraction, ScanError>;
}

pub struct FfmpegExtractor {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegExtractor {
    pub fn new() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }

    async fn has_subtitle_stream(&self, video: &Path) -> Result<Option<bool>, ScanError> {
        let output = match Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-select_streams",
                "s",
            ])
            .arg(video)
            .output()
            .await
        {
            Ok(output) => output,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(extraction_error(video, format!("ffprobe: {err}"))),
        };

        if !output.status.success() {
            return Ok(Some(false));
        }

        let json: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|err| extraction_error(video, format!("ffprobe output: {err}")))?;
        let streams = json["streams"].as_array().map(|s| s.len()).unwrap_or(0);
        debug!(path = %video.display(), streams, "probed subtitle streams");
        Ok(Some(streams > 0))
    }
}

impl Default for FfmpegExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubtitleExtractor for FfmpegExtractor {
    async fn extract(&self, video: &Path) -> Result<Extraction, ScanError> {
        match self.has_subtitle_stream(video).await? {
            None => return Ok(Extraction::ToolUnavailable),
            Some(false) => return Ok(Extraction::NoTrack),
            Some(true) => {}
        }

        let track = tempfile::Builder::new()
            .prefix("cws-")
            .suffix(".srt")
            .tempfile()
            .map_err(|err| extraction_error(video, format!("temp file: {err}")))?
            .into_temp_path();

        let output = match Command::new(&self.ffmpeg_path)
            .arg("-i")
            .arg(video)
            .args(["-map", "0:s:0", "-c:s", "srt", "-y"])
            .arg(&*track)
            .output()
            .await
        {
            Ok(output) => output,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Extraction::ToolUnavailable),
            Err(err) => return Err(extraction_error(video, format!("ffmpeg: {err}"))),
        };

        if !output.status.success() {
            return Err(extraction_error(
                video,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(Extraction::Track(track))
    }
}

fn extraction_error(video: &Path, message: String) -> ScanError {
    ScanError::Extraction {
        path: video.display().to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binaries_report_tool_unavailable() {
        let extractor = FfmpegExtractor {
            ffmpeg_path: "/nonexistent/ffmpeg".to_string(),
            ffprobe_path: "/nonexistent/ffprobe".to_string(),
        };
        let outcome = extractor.extract(Path::new("/media/movie.mkv")).await.unwrap();
        assert!(matches!(outcome, Extraction::ToolUnavailable));
    }
}
