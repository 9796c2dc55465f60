use std::{
    fmt,
    path::{Path, PathBuf},
};

use crate::error::{KagiError, KagiResult};

pub const KEY_LENGTH: usize = 16;

/// Contents of an ffmpeg style key info file.
///
/// ```text
/// https://keys.example/aes.key
/// /keys/aes.key
/// 0x00000000000000000000000000000000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyInfo {
    pub key_uri: String,
    pub key_file: PathBuf,
    pub iv: Option<[u8; 16]>,
}

impl KeyInfo {
    pub fn parse(text: &str) -> KagiResult<Self> {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if lines.len() < 2 {
            return Err(KagiError::MalformedKeyInfo);
        }

        Ok(Self {
            key_uri: lines[0].to_string(),
            key_file: PathBuf::from(lines[1]),
            iv: lines.get(2).map(|iv| parse_iv(iv)).transpose()?,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> KagiResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| KagiError::KeyFileUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut info = Self::parse(&text)?;

        // relative key paths are resolved next to the key info file
        if info.key_file.is_relative() {
            if let Some(parent) = path.parent() {
                info.key_file = parent.join(&info.key_file);
            }
        }
        Ok(info)
    }
}

pub fn parse_iv(iv: &str) -> KagiResult<[u8; 16]> {
    let s = iv.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if s.len() != 32 {
        return Err(KagiError::InvalidIv(iv.to_string()));
    }

    hex::decode(s)?
        .try_into()
        .map_err(|_| KagiError::InvalidIv(iv.to_string()))
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum IvMode {
    Explicit([u8; 16]),
    /// IV is the media sequence number as a big-endian 128-bit integer.
    SequenceDerived,
}

impl fmt::Debug for IvMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IvMode::Explicit(iv) => write!(f, "Explicit(0x{})", hex::encode(iv)),
            IvMode::SequenceDerived => f.write_str("SequenceDerived"),
        }
    }
}

/// Values passed on the command line win over the key info file.
#[derive(Debug, Clone, Default)]
pub struct KeyOverrides {
    pub key_uri: Option<String>,
    pub key_file: Option<PathBuf>,
    pub iv: Option<String>,
}

#[derive(Clone)]
pub struct KeyMaterial {
    key: [u8; KEY_LENGTH],
    key_uri: String,
    iv_mode: IvMode,
}

impl KeyMaterial {
    pub fn new(key: [u8; KEY_LENGTH], key_uri: impl Into<String>, iv_mode: IvMode) -> Self {
        Self {
            key,
            key_uri: key_uri.into(),
            iv_mode,
        }
    }

    pub fn load(key_info: Option<&Path>, overrides: KeyOverrides) -> KagiResult<Self> {
        let info = key_info.map(KeyInfo::load).transpose()?;

        let key_uri = overrides
            .key_uri
            .or_else(|| info.as_ref().map(|i| i.key_uri.clone()))
            .filter(|u| !u.is_empty())
            .ok_or(KagiError::MissingKeyMaterial)?;
        let key_file = overrides
            .key_file
            .or_else(|| info.as_ref().map(|i| i.key_file.clone()))
            .ok_or(KagiError::MissingKeyMaterial)?;
        let iv = match overrides.iv {
            Some(iv) => Some(parse_iv(&iv)?),
            None => info.and_then(|i| i.iv),
        };

        let key = read_key_file(&key_file)?;
        let iv_mode = iv.map_or(IvMode::SequenceDerived, IvMode::Explicit);
        log::info!("Loaded key for {key_uri} from {}, IV: {iv_mode:?}", key_file.display());

        Ok(Self::new(key, key_uri, iv_mode))
    }

    pub fn key(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    pub fn key_uri(&self) -> &str {
        &self.key_uri
    }

    pub fn iv_mode(&self) -> IvMode {
        self.iv_mode
    }

    pub fn iv_for(&self, sequence: u64) -> [u8; 16] {
        match self.iv_mode {
            IvMode::Explicit(iv) => iv,
            IvMode::SequenceDerived => (sequence as u128).to_be_bytes(),
        }
    }

    /// The `#EXT-X-KEY` line advertised in rewritten playlists.
    pub fn key_directive(&self) -> String {
        let mut line = format!("#EXT-X-KEY:METHOD=AES-128,URI=\"{}\"", self.key_uri);
        if let IvMode::Explicit(iv) = self.iv_mode {
            line.push_str(",IV=0x");
            line.push_str(&hex::encode(iv));
        }
        line
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"<redacted>")
            .field("key_uri", &self.key_uri)
            .field("iv_mode", &self.iv_mode)
            .finish()
    }
}

fn read_key_file(path: &Path) -> KagiResult<[u8; KEY_LENGTH]> {
    let key = std::fs::read(path).map_err(|source| KagiError::KeyFileUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let len = key.len();
    key.try_into().map_err(|_| KagiError::InvalidKeyLength {
        path: path.to_path_buf(),
        len,
    })
}
