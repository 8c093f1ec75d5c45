//! Text encodings understood by the `encoding` port property.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Character encoding applied to commands and answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TextEncoding {
    /// ISO-8859-1; every byte maps to exactly one char.
    #[default]
    Latin1,
    Utf8,
    Ascii,
}

impl TextEncoding {
    pub fn encode(&self, text: &str) -> Option<Vec<u8>> {
        match self {
            Self::Utf8 => Some(text.as_bytes().to_vec()),
            Self::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).ok())
                .collect(),
            Self::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { Some(c as u8) } else { None })
                .collect(),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Self::Utf8 => String::from_utf8(bytes.to_vec()).ok(),
            Self::Latin1 => Some(latin1_lossless(bytes)),
            Self::Ascii => {
                if bytes.is_ascii() {
                    Some(latin1_lossless(bytes))
                } else {
                    None
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Latin1 => "latin-1",
            Self::Utf8 => "utf-8",
            Self::Ascii => "ascii",
        }
    }
}

/// Map bytes 1:1 onto chars U+0000..U+00FF.
pub fn latin1_lossless(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TextEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" | "cp819" => Ok(Self::Latin1),
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "ascii" | "us-ascii" => Ok(Self::Ascii),
            other => Err(format!("unsupported encoding '{other}'")),
        }
    }
}
