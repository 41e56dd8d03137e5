use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::ScanError;
use crate::extract::{Extraction, SubtitleExtractor};
use crate::models::Segment;

static SRT_TIMING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d{2}:\d{2}:\d{2},\d{3})\s*-->\s*(\d{2}:\d{2}:\d{2},\d{3})\s*$")
        .expect("valid srt timing regex")
});
static VTT_TIMING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d{2}:\d{2}:\d{2}\.\d{3})\s*-->\s*(\d{2}:\d{2}:\d{2}\.\d{3})(?:\s+.*)?$")
        .expect("valid vtt timing regex")
});
static VTT_CUE_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d{2}:\d{2}:\d{2}").expect("valid vtt cue start regex"));
static INDEX_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+\s*$").expect("valid index line regex"));
static MARKUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid markup regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// `HH:MM:SS,mmm` timings with a numeric index line per block.
    SubRip,
    /// `HH:MM:SS.mmm` timings, no index line.
    WebVtt,
    /// Container whose subtitle track must be extracted first.
    Video,
    Unsupported,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "srt" => SourceKind::SubRip,
            "vtt" => SourceKind::WebVtt,
            "mp4" | "mkv" | "avi" => SourceKind::Video,
            _ => SourceKind::Unsupported,
        }
    }
}

/// Parse textual subtitle content. Pure function of its input.
pub fn segment(kind: SourceKind, content: &str) -> Vec<Segment> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let lines: Vec<&str> = content.lines().collect();
    match kind {
        SourceKind::SubRip => parse_subrip(&lines),
        SourceKind::WebVtt => parse_webvtt(&lines),
        SourceKind::Video | SourceKind::Unsupported => Vec::new(),
    }
}

fn parse_subrip(lines: &[&str]) -> Vec<Segment> {
    let mut builder = SegmentBuilder::default();
    let mut i = 0;

    while i < lines.len() {
        let timing = if INDEX_LINE.is_match(lines[i]) {
            lines.get(i + 1).and_then(|line| SRT_TIMING.captures(line))
        } else {
            None
        };

        let Some(caps) = timing else {
            i += 1;
            continue;
        };

        let body_start = i + 2;
        let mut end = body_start;
        while end < lines.len() && !lines[end].trim().is_empty() && !INDEX_LINE.is_match(lines[end])
        {
            end += 1;
        }

        builder.push(&caps[1], &caps[2], &lines[body_start..end]);
        i = end;
    }

    builder.finish()
}

fn parse_webvtt(lines: &[&str]) -> Vec<Segment> {
    let mut builder = SegmentBuilder::default();
    let mut i = 0;

    while i < lines.len() {
        let Some(caps) = VTT_TIMING.captures(lines[i]) else {
            i += 1;
            continue;
        };

        let body_start = i + 1;
        let mut end = body_start;
        while end < lines.len()
            && !lines[end].trim().is_empty()
            && !VTT_CUE_START.is_match(lines[end])
        {
            end += 1;
        }

        builder.push(&caps[1], &caps[2], &lines[body_start..end]);
        i = end;
    }

    builder.finish()
}

#[derive(Default)]
struct SegmentBuilder {
    segments: Vec<Segment>,
}

impl SegmentBuilder {
    fn push(&mut self, start: &str, end: &str, body: &[&str]) {
        let start = normalize_timecode(start);
        let end = normalize_timecode(end);
        if start > end {
            debug!(%start, %end, "skipping cue that ends before it starts");
            return;
        }

        let text = clean_text(&body.join("\n"));
        if text.is_empty() {
            return;
        }

        self.segments.push(Segment {
            index: self.segments.len() + 1,
            start,
            end,
            text,
        });
    }

    fn finish(self) -> Vec<Segment> {
        self.segments
    }
}

/// `HH:MM:SS,mmm` becomes `HH:MM:SS.mmm`; fixed width keeps string order
/// equal to time order.
fn normalize_timecode(raw: &str) -> String {
    raw.trim().replace(',', ".")
}

fn clean_text(raw: &str) -> String {
    MARKUP.replace_all(raw, "").replace('\n', " ").trim().to_string()
}

/// Resolve a file on disk into segments, extracting the subtitle track from
/// video containers first.
pub async fn segment_file(path: &Path, extractor: &dyn SubtitleExtractor) -> Vec<Segment> {
    let kind = SourceKind::from_path(path);
    match kind {
        SourceKind::SubRip | SourceKind::WebVtt => read_and_segment(path, kind).await,
        SourceKind::Video => match extractor.extract(path).await {
            Ok(Extraction::Track(track)) => read_and_segment(&track, SourceKind::SubRip).await,
            Ok(Extraction::NoTrack) => {
                info!(path = %path.display(), "no subtitle track found");
                Vec::new()
            }
            Ok(Extraction::ToolUnavailable) => {
                warn!(path = %path.display(), "subtitle extraction tool is not installed");
                Vec::new()
            }
            Err(err) => {
                warn!(error = %err, "subtitle extraction failed");
                Vec::new()
            }
        },
        SourceKind::Unsupported => {
            warn!(path = %path.display(), "unsupported file type");
            Vec::new()
        }
    }
}

async fn read_and_segment(path: &Path, kind: SourceKind) -> Vec<Segment> {
    match tokio::fs::read(path).await {
        Ok(bytes) => segment(kind, &String::from_utf8_lossy(&bytes)),
        Err(err) => {
            let err = ScanError::Parse {
                path: path.display().to_string(),
                message: err.to_string(),
            };
            warn!(error = %err, "could not read subtitle source");
            Vec::new()
        }
    }
}
