use m3u8_rs::Playlist;

use crate::{
    classify::{Classifier, FileKind},
    error::{KagiError, KagiResult},
};

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    /// File name in the source directory, which is also the name at the destination.
    pub file_name: String,
    /// Sequence number parsed from the file name.
    pub sequence: u64,
    /// Media sequence number a player assigns to this segment.
    pub media_sequence: u64,
    pub duration: f32,
    pub discontinuity: bool,
}

/// A media playlist as it was on disk at one point in time.
#[derive(Debug, Clone)]
pub struct ManifestSnapshot {
    pub(crate) lines: Vec<String>,
    segments: Vec<SegmentEntry>,
    maps: Vec<String>,
    media_sequence: u64,
    end_list: bool,
}

impl ManifestSnapshot {
    pub fn parse(text: &str, classifier: &Classifier) -> KagiResult<Self> {
        let playlist = match m3u8_rs::parse_playlist_res(text.as_bytes()) {
            Ok(Playlist::MediaPlaylist(pl)) => pl,
            Ok(Playlist::MasterPlaylist(_)) => {
                return Err(KagiError::MasterPlaylist(first_line(text)))
            }
            Err(error) => return Err(KagiError::M3u8ParseError(error.to_string())),
        };

        let mut maps = Vec::new();
        let mut segments = Vec::with_capacity(playlist.segments.len());
        for (i, segment) in playlist.segments.iter().enumerate() {
            if segment.byte_range.is_some() {
                return Err(KagiError::ByteRangeUnsupported(segment.uri.clone()));
            }

            if let Some(map) = &segment.map {
                if map.byte_range.is_some() {
                    return Err(KagiError::ByteRangeUnsupported(map.uri.clone()));
                }
                let name = local_name(&map.uri)?;
                if !maps.contains(&name) {
                    maps.push(name);
                }
            }

            let file_name = local_name(&segment.uri)?;
            let FileKind::MediaSegment(sequence) = classifier.classify(&file_name) else {
                return Err(KagiError::UnknownSegment(file_name));
            };

            segments.push(SegmentEntry {
                file_name,
                sequence,
                media_sequence: playlist.media_sequence + i as u64,
                duration: segment.duration,
                discontinuity: segment.discontinuity,
            });
        }

        Ok(Self {
            lines: text
                .lines()
                .map(|l| l.trim_end_matches('\r').to_string())
                .collect(),
            segments,
            maps,
            media_sequence: playlist.media_sequence,
            end_list: playlist.end_list,
        })
    }

    pub fn segments(&self) -> &[SegmentEntry] {
        &self.segments
    }

    /// File names of every `#EXT-X-MAP` in the playlist.
    pub fn maps(&self) -> &[String] {
        &self.maps
    }

    pub fn media_sequence(&self) -> u64 {
        self.media_sequence
    }

    pub fn is_end(&self) -> bool {
        self.end_list
    }

    pub fn highest_referenced_sequence(&self) -> Option<u64> {
        self.segments.iter().map(|s| s.sequence).max()
    }

    pub fn references(&self, file_name: &str) -> bool {
        self.segments.iter().any(|s| s.file_name == file_name)
            || self.maps.iter().any(|m| m == file_name)
    }

    /// Segments whose file name sequence differs from their media sequence.
    ///
    /// Players derive the IV from the media sequence, so these can not be
    /// decrypted when the IV is derived from the file name.
    pub fn sequence_mismatches(&self) -> impl Iterator<Item = &SegmentEntry> {
        self.segments
            .iter()
            .filter(|s| s.sequence != s.media_sequence)
    }
}

/// Only plain file names next to the playlist can be mirrored.
fn local_name(uri: &str) -> KagiResult<String> {
    let uri = uri.trim();
    if uri.is_empty()
        || uri.contains("://")
        || uri.contains(['/', '\\', '?', '#'])
        || uri == "."
        || uri == ".."
    {
        return Err(KagiError::ForeignSegment(uri.to_string()));
    }
    Ok(uri.to_string())
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYLIST: &str = "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-MAP:URI=\"init.mp4\"
#EXTINF:4.000000,
index000.m4s
#EXT-X-DISCONTINUITY
#EXTINF:3.500000,
index001.m4s
#EXT-X-ENDLIST
";

    #[test]
    fn test_parse_snapshot() {
        let snapshot = ManifestSnapshot::parse(PLAYLIST, &Classifier::default()).unwrap();
        assert!(snapshot.is_end());
        assert_eq!(snapshot.maps(), ["init.mp4"]);
        assert_eq!(snapshot.segments().len(), 2);
        assert_eq!(snapshot.segments()[0].file_name, "index000.m4s");
        assert_eq!(snapshot.segments()[1].sequence, 1);
        assert_eq!(snapshot.segments()[1].media_sequence, 1);
        assert!(snapshot.segments()[1].discontinuity);
        assert_eq!(snapshot.highest_referenced_sequence(), Some(1));
        assert!(snapshot.references("index001.m4s"));
        assert!(snapshot.references("init.mp4"));
        assert!(!snapshot.references("index002.m4s"));
        assert_eq!(snapshot.sequence_mismatches().count(), 0);
    }

    #[test]
    fn test_sliding_window_sequence() {
        let text = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:10
#EXTINF:4,
index010.m4s
#EXTINF:4,
index012.m4s
";
        let snapshot = ManifestSnapshot::parse(text, &Classifier::default()).unwrap();
        assert!(!snapshot.is_end());
        assert_eq!(snapshot.media_sequence(), 10);
        let mismatches: Vec<_> = snapshot.sequence_mismatches().collect();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].file_name, "index012.m4s");
        assert_eq!(mismatches[0].media_sequence, 11);
    }

    #[test]
    fn test_reject_foreign_segment() {
        let text = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXTINF:4,
https://cdn.example/index000.m4s
";
        assert!(matches!(
            ManifestSnapshot::parse(text, &Classifier::default()),
            Err(KagiError::ForeignSegment(_))
        ));
    }

    #[test]
    fn test_reject_unknown_segment() {
        let text = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXTINF:4,
index000.ts
";
        assert!(matches!(
            ManifestSnapshot::parse(text, &Classifier::default()),
            Err(KagiError::UnknownSegment(_))
        ));
    }

    #[test]
    fn test_reject_garbage() {
        assert!(matches!(
            ManifestSnapshot::parse("not a playlist", &Classifier::default()),
            Err(KagiError::M3u8ParseError(_))
        ));
    }

    #[test]
    fn test_reject_master_playlist() {
        let text = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720
720p.m3u8
";
        assert!(matches!(
            ManifestSnapshot::parse(text, &Classifier::default()),
            Err(KagiError::MasterPlaylist(_))
        ));
    }
}
