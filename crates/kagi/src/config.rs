use std::{num::NonZeroU32, path::PathBuf, time::Duration};

use regex::Regex;

use crate::{
    classify::{Classifier, DEFAULT_INIT_NAME, DEFAULT_SEGMENT_EXTENSIONS},
    error::KagiResult,
    watch::{DirectoryWatcher, WatcherBackend},
};

/// Everything the pipeline needs besides the key. Fixed once the pipeline starts.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source_dir: PathBuf,
    pub dest_dir: PathBuf,

    pub init_name: String,
    pub segment_extensions: Vec<String>,
    pub segment_pattern: Option<Regex>,
    /// Prepended to segment URIs in the published playlist.
    pub uri_prefix: Option<String>,

    pub backend: WatcherBackend,
    pub poll_interval: Duration,
    /// A file must keep the same size and mtime for this long to be read.
    pub debounce: Duration,
    /// Warn about files that are still changing after this long.
    pub stall_after: Duration,
    pub queue_capacity: usize,

    pub workers: NonZeroU32,
    /// Attempts per segment before giving up until the encoder touches it again.
    pub retries: u32,
    pub retry_interval: Duration,

    /// Empty the destination directory when the pipeline stops.
    pub clean_on_exit: bool,
}

impl PipelineConfig {
    pub fn builder(
        source_dir: impl Into<PathBuf>,
        dest_dir: impl Into<PathBuf>,
    ) -> PipelineConfigBuilder {
        PipelineConfigBuilder::new(source_dir.into(), dest_dir.into())
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(
            self.init_name.clone(),
            self.segment_extensions.iter().cloned(),
            self.segment_pattern.clone(),
        )
    }

    pub fn watcher(&self) -> DirectoryWatcher {
        DirectoryWatcher::new(&self.source_dir)
            .backend(self.backend)
            .poll_interval(self.poll_interval)
            .debounce(self.debounce)
            .stall_after(self.stall_after)
            .capacity(self.queue_capacity)
    }
}

pub struct PipelineConfigBuilder {
    config: PipelineConfig,
    pattern: Option<String>,
}

impl PipelineConfigBuilder {
    fn new(source_dir: PathBuf, dest_dir: PathBuf) -> Self {
        Self {
            config: PipelineConfig {
                source_dir,
                dest_dir,
                init_name: DEFAULT_INIT_NAME.to_string(),
                segment_extensions: DEFAULT_SEGMENT_EXTENSIONS
                    .iter()
                    .map(|e| e.to_string())
                    .collect(),
                segment_pattern: None,
                uri_prefix: None,
                backend: WatcherBackend::Auto,
                poll_interval: Duration::from_millis(500),
                debounce: Duration::from_millis(300),
                stall_after: Duration::from_secs(30),
                queue_capacity: 64,
                workers: NonZeroU32::new(4).unwrap(),
                retries: 5,
                retry_interval: Duration::from_secs(1),
                clean_on_exit: false,
            },
            pattern: None,
        }
    }

    pub fn init_name(mut self, init_name: impl Into<String>) -> Self {
        self.config.init_name = init_name.into();
        self
    }

    pub fn segment_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.segment_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Regex matched against segment file names, overriding the extension list.
    ///
    /// The sequence number is taken from the `seq` group, or from the digits
    /// at the end of the file stem.
    pub fn segment_pattern(mut self, pattern: Option<String>) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn uri_prefix(mut self, prefix: Option<String>) -> Self {
        self.config.uri_prefix = prefix;
        self
    }

    pub fn backend(mut self, backend: WatcherBackend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.config.debounce = debounce;
        self
    }

    pub fn stall_after(mut self, stall_after: Duration) -> Self {
        self.config.stall_after = stall_after;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity.max(1);
        self
    }

    pub fn workers(mut self, workers: NonZeroU32) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    pub fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.config.retry_interval = retry_interval;
        self
    }

    pub fn clean_on_exit(mut self, clean_on_exit: bool) -> Self {
        self.config.clean_on_exit = clean_on_exit;
        self
    }

    pub fn build(self) -> KagiResult<PipelineConfig> {
        let mut config = self.config;
        config.segment_pattern = self.pattern.as_deref().map(Regex::new).transpose()?;
        Ok(config)
    }
}
