//! ┌─────────────────────┐               ┌──────────────────────┐
//! │                     │  index.m3u8   │                      │  #EXT-X-KEY + same lines
//! │                     ├───────────────►                      ├──────────────────────────►
//! │                     │               │                      │
//! │   Encoder output    │   init.mp4    │                      │  byte-identical copy
//! │    (source dir)     ├───────────────►       Pipeline       ├──────────────────────────►
//! │                     │               │                      │
//! │                     │ indexNNN.m4s  │  [MPSC]   [Workers]  │  AES-128-CBC, IV = NNN
//! │                     ├───────────────►                      ├──────────────────────────►
//! └─────────────────────┘               └──────────────────────┘       (destination dir)
//!
//! A playlist revision is only published after every file it names has been
//! renamed into place at the destination.

pub mod classify;
pub mod config;
pub mod crypt;
pub mod error;
pub mod hls;
pub mod key;
pub mod pipeline;
pub mod util;
pub mod watch;

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{KagiError, KagiResult};
pub use key::{IvMode, KeyMaterial, KeyOverrides};
pub use pipeline::{Pipeline, RunSummary};
