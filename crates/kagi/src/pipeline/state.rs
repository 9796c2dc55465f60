use std::{collections::HashMap, path::PathBuf};

use crate::{hls::ManifestSnapshot, util::Fingerprint};

/// Lifecycle of a media segment. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SegmentState {
    Discovered,
    Quiesced,
    /// Ciphertext has been renamed into place at the destination.
    Encrypted,
    /// Referenced by a published playlist.
    Published,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InitState {
    Discovered,
    Quiesced,
    Published,
}

#[derive(Debug)]
pub struct SegmentRef {
    pub sequence: u64,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    state: SegmentState,

    /// Source version whose ciphertext is at the destination.
    pub(crate) encrypted: Option<Fingerprint>,
    pub(crate) in_flight: bool,
    /// The source changed again while it was being encrypted.
    pub(crate) dirty: bool,
    /// The source changed since its ciphertext was published at the destination.
    pub(crate) stale: bool,
    /// Last source version that was ready, the retry budget belongs to it.
    pub(crate) version: Option<Fingerprint>,
    pub(crate) attempts: u32,
    /// The encoder deleted the source file.
    pub(crate) removed: bool,
}

impl SegmentRef {
    pub fn new(sequence: u64, source_path: PathBuf, dest_path: PathBuf) -> Self {
        Self {
            sequence,
            source_path,
            dest_path,
            state: SegmentState::Discovered,
            encrypted: None,
            in_flight: false,
            dirty: false,
            stale: false,
            version: None,
            attempts: 0,
            removed: false,
        }
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Move to `to` if that is further along. Returns whether the state changed.
    pub fn advance(&mut self, to: SegmentState) -> bool {
        if to > self.state {
            self.state = to;
            true
        } else {
            false
        }
    }

    /// Whether a playlist may reference this segment right now.
    ///
    /// Once published, a segment stays available while a new version is
    /// encrypted, the rename swaps it in place. Before that, the ciphertext
    /// must belong to the current source.
    pub fn is_available(&self) -> bool {
        match self.state {
            SegmentState::Published => true,
            SegmentState::Encrypted => !self.stale && !self.in_flight && !self.dirty,
            _ => false,
        }
    }

    /// Record `version` as the source version that is ready now.
    ///
    /// A new version gets a fresh set of attempts. Returns false when this
    /// version already failed `retries` times.
    pub(crate) fn observe(&mut self, version: Fingerprint, retries: u32) -> bool {
        if self.version != Some(version) {
            self.version = Some(version);
            self.attempts = 0;
        }
        self.attempts == 0 || self.attempts < retries
    }
}

#[derive(Debug)]
pub struct InitSegment {
    pub file_name: String,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    state: InitState,
    pub(crate) published: Option<Fingerprint>,
    pub(crate) attempts: u32,
}

impl InitSegment {
    pub fn new(file_name: String, source_path: PathBuf, dest_path: PathBuf) -> Self {
        Self {
            file_name,
            source_path,
            dest_path,
            state: InitState::Discovered,
            published: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    pub fn advance(&mut self, to: InitState) -> bool {
        if to > self.state {
            self.state = to;
            true
        } else {
            false
        }
    }
}

/// Revisions of one playlist file.
#[derive(Debug, Default)]
pub(crate) struct ManifestSlot {
    /// Newest parsed revision that has not been published yet.
    pub pending: Option<ManifestSnapshot>,
    pub published: Option<ManifestSnapshot>,
    /// What the last deferral was waiting for, to avoid repeating the same log line.
    pub waiting_for: Option<String>,
    pub warned_sequence_mismatch: bool,
}

/// Everything the coordinator knows. Only the coordinator mutates it.
#[derive(Debug, Default)]
pub struct PipelineState {
    pub(crate) segments: HashMap<String, SegmentRef>,
    pub(crate) init: Option<InitSegment>,
    pub(crate) manifests: HashMap<String, ManifestSlot>,
}

impl PipelineState {
    pub fn segment(&self, file_name: &str) -> Option<&SegmentRef> {
        self.segments.get(file_name)
    }

    pub fn init(&self) -> Option<&InitSegment> {
        self.init.as_ref()
    }

    pub(crate) fn discover_segment(
        &mut self,
        file_name: &str,
        sequence: u64,
        source_path: PathBuf,
        dest_path: PathBuf,
    ) -> &mut SegmentRef {
        self.segments
            .entry(file_name.to_string())
            .or_insert_with(|| {
                log::debug!("Discovered segment {file_name} (sequence {sequence})");
                SegmentRef::new(sequence, source_path, dest_path)
            })
    }

    pub(crate) fn discover_init(
        &mut self,
        file_name: &str,
        source_path: PathBuf,
        dest_path: PathBuf,
    ) -> &mut InitSegment {
        self.init.get_or_insert_with(|| {
            log::debug!("Discovered init segment {file_name}");
            InitSegment::new(file_name.to_string(), source_path, dest_path)
        })
    }

    /// Files `snapshot` references that are not yet at the destination.
    pub fn missing_for(&self, snapshot: &ManifestSnapshot) -> Vec<String> {
        let mut missing = Vec::new();
        for map in snapshot.maps() {
            let published = self
                .init
                .as_ref()
                .is_some_and(|i| &i.file_name == map && i.state() == InitState::Published);
            if !published {
                missing.push(map.clone());
            }
        }
        for segment in snapshot.segments() {
            let available = self
                .segments
                .get(&segment.file_name)
                .is_some_and(SegmentRef::is_available);
            if !available {
                missing.push(segment.file_name.clone());
            }
        }
        missing
    }

    /// Whether any playlist revision we hold still names `file_name`.
    pub(crate) fn is_referenced(&self, file_name: &str) -> bool {
        self.manifests.values().any(|slot| {
            slot.published
                .iter()
                .chain(slot.pending.iter())
                .any(|snapshot| snapshot.references(file_name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Classifier;

    fn snapshot() -> ManifestSnapshot {
        ManifestSnapshot::parse(
            "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-MAP:URI=\"init.mp4\"
#EXTINF:4,
index000.m4s
#EXTINF:4,
index001.m4s
",
            &Classifier::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_segment_state_never_regresses() {
        let mut segment = SegmentRef::new(0, "a".into(), "b".into());
        assert!(segment.advance(SegmentState::Encrypted));
        assert!(!segment.advance(SegmentState::Quiesced));
        assert_eq!(segment.state(), SegmentState::Encrypted);
        assert!(segment.advance(SegmentState::Published));
        assert!(!segment.advance(SegmentState::Published));
    }

    #[test]
    fn test_stale_segment_is_unavailable_until_published() {
        let mut segment = SegmentRef::new(1, "a".into(), "b".into());
        assert!(!segment.is_available());
        segment.advance(SegmentState::Encrypted);
        assert!(segment.is_available());

        // the encoder wrote to the file after an early version was encrypted
        segment.stale = true;
        assert!(!segment.is_available());
        segment.stale = false;
        segment.in_flight = true;
        assert!(!segment.is_available());
        segment.in_flight = false;
        segment.dirty = true;
        assert!(!segment.is_available());

        segment.advance(SegmentState::Published);
        segment.stale = true;
        assert!(segment.is_available());
    }

    #[test]
    fn test_retry_budget_belongs_to_version() {
        let first = Fingerprint {
            len: 10,
            modified: None,
        };
        let second = Fingerprint {
            len: 20,
            modified: None,
        };

        let mut segment = SegmentRef::new(1, "a".into(), "b".into());
        assert!(segment.observe(first, 3));
        segment.attempts = 3;
        // the same version is not retried again
        assert!(!segment.observe(first, 3));
        assert_eq!(segment.attempts, 3);

        assert!(segment.observe(second, 3));
        assert_eq!(segment.attempts, 0);
        segment.attempts = 1;
        assert!(segment.observe(second, 3));
        assert_eq!(segment.attempts, 1);
    }

    #[test]
    fn test_missing_for() {
        let mut state = PipelineState::default();
        assert_eq!(
            state.missing_for(&snapshot()),
            ["init.mp4", "index000.m4s", "index001.m4s"]
        );

        state
            .discover_init("init.mp4", "s/init.mp4".into(), "d/init.mp4".into())
            .advance(InitState::Published);
        state
            .discover_segment("index000.m4s", 0, "s/0".into(), "d/0".into())
            .advance(SegmentState::Encrypted);
        state
            .discover_segment("index001.m4s", 1, "s/1".into(), "d/1".into())
            .advance(SegmentState::Quiesced);
        assert_eq!(state.missing_for(&snapshot()), ["index001.m4s"]);

        state.segments.get_mut("index001.m4s").unwrap().advance(SegmentState::Encrypted);
        assert!(state.missing_for(&snapshot()).is_empty());

        // segments whose destination file was deleted are forgotten
        state.segments.remove("index000.m4s");
        assert_eq!(state.missing_for(&snapshot()), ["index000.m4s"]);
    }

    #[test]
    fn test_is_referenced() {
        let mut state = PipelineState::default();
        assert!(!state.is_referenced("index000.m4s"));

        state.manifests.insert(
            "index.m3u8".to_string(),
            ManifestSlot {
                published: Some(snapshot()),
                ..Default::default()
            },
        );
        assert!(state.is_referenced("index000.m4s"));
        assert!(state.is_referenced("init.mp4"));
        assert!(!state.is_referenced("index002.m4s"));
    }
}
