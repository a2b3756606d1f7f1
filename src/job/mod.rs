//! Job records consumed from the translation queue.
//!
//! A [`JobMessage`] is one queue entry: the English subtitle to translate
//! plus the video it belongs to. It is validated once, translated once and
//! then dropped.

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Language marker replaced when deriving the translated subtitle path.
const SOURCE_LANGUAGE_MARKER: &str = ".eng";

/// One unit of translation work as pushed onto the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Display name of the media file.
    #[serde(default)]
    pub file_name: String,
    /// Path of the subtitle file to translate.
    #[serde(default)]
    pub path: String,
    /// Path of the video the subtitle belongs to, passed through unchanged.
    #[serde(default)]
    pub video_path: String,
    /// Free-text overview used as translation context.
    #[serde(default)]
    pub overview: String,
    /// Upstream tag of whoever enqueued the job.
    #[serde(default)]
    pub provider: String,
}

impl JobMessage {
    /// Creates a job for the given subtitle path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Sets the video path.
    pub fn with_video_path(mut self, video_path: impl Into<String>) -> Self {
        self.video_path = video_path.into();
        self
    }

    /// Sets the overview.
    pub fn with_overview(mut self, overview: impl Into<String>) -> Self {
        self.overview = overview.into();
        self
    }

    /// Checks that the job can be translated at all.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.path.trim().is_empty() {
            return Err(JobError::MissingPath);
        }
        Ok(())
    }

    /// Derives the translated subtitle path from the input path.
    ///
    /// `movie.eng.srt` becomes `movie.chs.srt`, `movie.srt` becomes
    /// `movie.chs.srt`, and a path without an extension gets the suffix
    /// appended. A leading `.` on the suffix is ignored.
    pub fn output_path(&self, suffix: &str) -> String {
        let clean_suffix = suffix.trim_start_matches('.');
        if clean_suffix.is_empty() {
            return self.path.clone();
        }

        let replacement = clean_suffix
            .split_once('.')
            .map_or(clean_suffix, |(head, _)| head);

        // ASCII lowercasing keeps byte offsets aligned with the original path.
        let lower_path = self.path.to_ascii_lowercase();
        if let Some(idx) = lower_path.rfind(SOURCE_LANGUAGE_MARKER) {
            let prefix = &self.path[..=idx];
            let rest = &self.path[idx + SOURCE_LANGUAGE_MARKER.len()..];
            return format!("{prefix}{replacement}{rest}");
        }

        match extension_start(&self.path) {
            Some(dot) => {
                let (stem, ext) = self.path.split_at(dot);
                format!("{stem}.{clean_suffix}{ext}")
            }
            None => format!("{}.{}", self.path, clean_suffix),
        }
    }

    /// Short label used in log lines.
    pub fn display_name(&self) -> &str {
        if self.file_name.is_empty() {
            &self.path
        } else {
            &self.file_name
        }
    }
}

/// Byte offset of the extension dot in the final path component, if any.
fn extension_start(path: &str) -> Option<usize> {
    let name_start = path.rfind(['/', '\\']).map_or(0, |i| i + 1);
    let name = &path[name_start..];
    match name.rfind('.') {
        Some(0) | None => None,
        Some(dot) => Some(name_start + dot),
    }
}
