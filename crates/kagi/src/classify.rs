use regex::Regex;

pub const DEFAULT_INIT_NAME: &str = "init.mp4";
pub const DEFAULT_SEGMENT_EXTENSIONS: &[&str] = &["m4s", "mp4", "cmf", "cmfv", "cmfa"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Manifest,
    InitSegment,
    MediaSegment(u64),
    Ignored,
}

/// Decides the role of a file in the source directory by its name only.
#[derive(Debug, Clone)]
pub struct Classifier {
    init_name: String,
    extensions: Vec<String>,
    pattern: Option<Regex>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_INIT_NAME,
            DEFAULT_SEGMENT_EXTENSIONS.iter().map(|e| e.to_string()),
            None,
        )
    }
}

impl Classifier {
    pub fn new<I>(init_name: impl Into<String>, extensions: I, pattern: Option<Regex>) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            init_name: init_name.into(),
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            pattern,
        }
    }

    pub fn init_name(&self) -> &str {
        &self.init_name
    }

    pub fn classify(&self, file_name: &str) -> FileKind {
        if file_name.starts_with('.') {
            return FileKind::Ignored;
        }
        if file_name == self.init_name {
            return FileKind::InitSegment;
        }

        let (stem, ext) = file_name.rsplit_once('.').unwrap_or((file_name, ""));
        let ext = ext.to_lowercase();
        if ext == "m3u8" {
            return FileKind::Manifest;
        }

        let sequence = match &self.pattern {
            Some(pattern) => pattern.captures(file_name).and_then(|c| {
                match c.name("seq") {
                    Some(seq) => seq.as_str().parse().ok(),
                    None => trailing_number(stem),
                }
            }),
            None if self.extensions.contains(&ext) => trailing_number(stem),
            None => None,
        };

        sequence.map_or(FileKind::Ignored, FileKind::MediaSegment)
    }
}

/// `index012` -> 12
fn trailing_number(stem: &str) -> Option<u64> {
    let digits = stem.len() - stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    stem[stem.len() - digits..].parse().ok()
}
