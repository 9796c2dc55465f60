use crate::{hls::ManifestSnapshot, key::KeyMaterial};

/// Turns a source playlist into the playlist served next to the encrypted segments.
///
/// Only three things change: source `#EXT-X-KEY` tags are dropped, a single key
/// tag is inserted right before the first media segment, and segment URIs are
/// mapped to their published names. Every other line is kept as is.
#[derive(Debug, Clone)]
pub struct ManifestRewriter {
    key_directive: String,
    uri_prefix: Option<String>,
}

impl ManifestRewriter {
    pub fn new(key: &KeyMaterial) -> Self {
        Self {
            key_directive: key.key_directive(),
            uri_prefix: None,
        }
    }

    /// Prefix prepended to every segment and map URI, e.g. a CDN base URL.
    pub fn with_uri_prefix(mut self, prefix: Option<String>) -> Self {
        self.uri_prefix = prefix.filter(|p| !p.is_empty());
        self
    }

    pub fn rewrite(&self, snapshot: &ManifestSnapshot) -> String {
        let mut output = Vec::with_capacity(snapshot.lines.len() + 1);
        let mut injected = false;

        for line in &snapshot.lines {
            let trimmed = line.trim();
            if trimmed.starts_with("#EXT-X-KEY") {
                continue;
            }

            let is_uri = !trimmed.is_empty() && !trimmed.starts_with('#');
            let starts_segment = is_uri || trimmed.starts_with("#EXTINF");
            // a playlist without segments still advertises the key
            if !injected && (starts_segment || trimmed.starts_with("#EXT-X-ENDLIST")) {
                output.push(self.key_directive.clone());
                injected = true;
            }

            if is_uri {
                output.push(self.map_uri(trimmed));
            } else if trimmed.starts_with("#EXT-X-MAP") {
                output.push(self.map_map_tag(line));
            } else {
                output.push(line.clone());
            }
        }

        if !injected {
            output.push(self.key_directive.clone());
        }

        let mut text = output.join("\n");
        text.push('\n');
        text
    }

    fn map_uri(&self, file_name: &str) -> String {
        match &self.uri_prefix {
            Some(prefix) => format!("{prefix}{file_name}"),
            None => file_name.to_string(),
        }
    }

    fn map_map_tag(&self, line: &str) -> String {
        let Some(prefix) = &self.uri_prefix else {
            return line.to_string();
        };
        let Some(start) = line.find("URI=\"").map(|i| i + 5) else {
            return line.to_string();
        };
        format!("{}{prefix}{}", &line[..start], &line[start..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{classify::Classifier, key::IvMode};

    const SOURCE: &str = "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-INDEPENDENT-SEGMENTS
#EXT-X-MAP:URI=\"init.mp4\"
#EXTINF:4.000000,
index000.m4s
#EXT-X-DISCONTINUITY
#EXTINF:3.500000,
index001.m4s
#EXT-X-ENDLIST
";

    fn key() -> KeyMaterial {
        KeyMaterial::new([1; 16], "https://keys.example/aes.key", IvMode::SequenceDerived)
    }

    fn parse(text: &str) -> ManifestSnapshot {
        ManifestSnapshot::parse(text, &Classifier::default()).unwrap()
    }

    #[test]
    fn test_rewrite_injects_key_before_first_segment() {
        let rewritten = ManifestRewriter::new(&key()).rewrite(&parse(SOURCE));
        assert_eq!(
            rewritten,
            "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-INDEPENDENT-SEGMENTS
#EXT-X-MAP:URI=\"init.mp4\"
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example/aes.key\"
#EXTINF:4.000000,
index000.m4s
#EXT-X-DISCONTINUITY
#EXTINF:3.500000,
index001.m4s
#EXT-X-ENDLIST
"
        );
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let rewriter = ManifestRewriter::new(&key());
        let once = rewriter.rewrite(&parse(SOURCE));
        let twice = rewriter.rewrite(&parse(&once));
        assert_eq!(once, twice);
        assert_eq!(twice.matches("#EXT-X-KEY").count(), 1);
    }

    #[test]
    fn test_rewrite_replaces_source_keys() {
        let source = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-KEY:METHOD=NONE
#EXTINF:4,
index000.m4s
#EXT-X-KEY:METHOD=NONE
#EXTINF:4,
index001.m4s
";
        let rewritten = ManifestRewriter::new(&key()).rewrite(&parse(source));
        assert_eq!(rewritten.matches("#EXT-X-KEY").count(), 1);
        assert!(!rewritten.contains("METHOD=NONE"));
    }

    #[test]
    fn test_rewrite_empty_live_playlist() {
        let source = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n";
        let rewritten = ManifestRewriter::new(&key()).rewrite(&parse(source));
        assert_eq!(
            rewritten,
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example/aes.key\"\n"
        );
    }

    #[test]
    fn test_rewrite_with_explicit_iv_and_prefix() {
        let key = KeyMaterial::new([1; 16], "/keys/aes.key", IvMode::Explicit([0; 16]));
        let rewritten = ManifestRewriter::new(&key)
            .with_uri_prefix(Some("https://cdn.example/live/".to_string()))
            .rewrite(&parse(SOURCE));

        assert!(rewritten.contains(
            "#EXT-X-KEY:METHOD=AES-128,URI=\"/keys/aes.key\",IV=0x00000000000000000000000000000000\n"
        ));
        assert!(rewritten.contains("#EXT-X-MAP:URI=\"https://cdn.example/live/init.mp4\"\n"));
        assert!(rewritten.contains("\nhttps://cdn.example/live/index000.m4s\n"));
        assert!(rewritten.contains("\nhttps://cdn.example/live/index001.m4s\n"));
    }
}
