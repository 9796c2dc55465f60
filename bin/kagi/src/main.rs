use std::{num::NonZeroU32, path::PathBuf, time::Duration};

use clap::Parser;
use kagi::{watch::WatcherBackend, KeyMaterial, KeyOverrides, Pipeline, PipelineConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
pub struct KagiArgs {
    /// Directory the encoder writes the playlist and segments to
    #[clap(long, env = "KAGI_SRC")]
    src: PathBuf,

    /// Directory the encrypted mirror is published to
    #[clap(long, env = "KAGI_DST")]
    dst: PathBuf,

    /// Key info file
    ///
    /// Line 1 is the key URI written to the playlist, line 2 the path of the
    /// 16 byte key file, and the optional line 3 a fixed IV in hex.
    #[clap(long, env = "KAGI_KEY_INFO")]
    key_info: Option<PathBuf>,

    /// Key URI, overrides line 1 of the key info file
    #[clap(long, env = "KAGI_KEY_URI")]
    key_uri: Option<String>,

    /// Key file path, overrides line 2 of the key info file
    #[clap(long, env = "KAGI_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Fixed IV as 32 hex digits. Derived from the segment number when not set.
    #[clap(long, env = "KAGI_KEY_IV")]
    key_iv: Option<String>,

    /// File name of the initialization segment
    #[clap(long, default_value = kagi::classify::DEFAULT_INIT_NAME)]
    init_name: String,

    /// Media segment extensions
    #[clap(long, value_delimiter = ',', default_value = "m4s,mp4,cmf,cmfv,cmfa")]
    exts: Vec<String>,

    /// Regex for media segment file names, overrides --exts
    ///
    /// The segment number is taken from the `seq` group, or from the digits at
    /// the end of the file name.
    #[clap(long)]
    pattern: Option<String>,

    /// Prefix for segment URIs in the published playlist
    #[clap(long)]
    uri_prefix: Option<String>,

    /// Files must be unchanged for this long before they are read
    #[clap(long, default_value = "300")]
    debounce_ms: u64,

    /// Encryption threads limit
    #[clap(long, default_value = "4")]
    workers: NonZeroU32,

    /// Retry limit
    #[clap(long, default_value = "5")]
    retries: u32,

    /// File watcher: auto, native or poll
    #[clap(long, env = "KAGI_WATCHER", default_value = "auto")]
    watcher: WatcherBackend,

    /// Polling interval of the poll watcher
    #[clap(long, default_value = "500")]
    poll_interval_ms: u64,

    /// Empty the destination directory on exit
    #[clap(long)]
    clean_on_exit: bool,

    /// Debug output
    #[clap(long, alias = "debug")]
    verbose: bool,
}

impl KagiArgs {
    fn config(&self) -> anyhow::Result<PipelineConfig> {
        Ok(PipelineConfig::builder(&self.src, &self.dst)
            .init_name(&self.init_name)
            .segment_extensions(self.exts.iter().map(|e| e.trim_start_matches('.')))
            .segment_pattern(self.pattern.clone())
            .uri_prefix(self.uri_prefix.clone())
            .backend(self.watcher)
            .poll_interval(Duration::from_millis(self.poll_interval_ms))
            .debounce(Duration::from_millis(self.debounce_ms))
            .workers(self.workers)
            .retries(self.retries)
            .clean_on_exit(self.clean_on_exit)
            .build()?)
    }

    fn key(&self) -> anyhow::Result<KeyMaterial> {
        Ok(KeyMaterial::load(
            self.key_info.as_deref(),
            KeyOverrides {
                key_uri: self.key_uri.clone(),
                key_file: self.key_file.clone(),
                iv: self.key_iv.clone(),
            },
        )?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = KagiArgs::parse();

    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let key = args.key()?;
    let pipeline = Pipeline::new(args.config()?, key)?;

    let cancel = CancellationToken::new();
    let signal_handler = tokio::spawn(shutdown_signal(cancel.clone()));

    let summary = pipeline.run(cancel).await?;
    signal_handler.abort();

    if summary.failed > 0 {
        log::warn!("{} segment(s) could not be encrypted.", summary.failed);
    }
    Ok(())
}

/// The first signal stops the pipeline gracefully, the second one exits immediately.
async fn shutdown_signal(cancel: CancellationToken) {
    wait_for_signal().await;
    log::info!("Signal received, finishing segments in progress.");
    cancel.cancel();

    wait_for_signal().await;
    log::info!("Signal received again, force exit.");
    std::process::exit(1);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            log::warn!("Failed to listen for SIGTERM: {e}");
            _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    _ = tokio::signal::ctrl_c().await;
}
