//! Persisted calibration offsets
//!
//! Plain text: the reference median on the first line, then one offset per
//! channel. A missing, unreadable or wrong-length file means "no calibration".

use crate::error::{BmsError, Result};
use crate::logging::{StructuredLogger, get_logger};
use std::path::{Path, PathBuf};

/// Reference median and per-channel offsets
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedOffsets {
    pub reference_median: f64,
    pub offsets: Vec<f64>,
}

impl PersistedOffsets {
    /// Text representation written to disk
    pub fn to_text(&self) -> String {
        let mut out = format!("{}\n", self.reference_median);
        for o in &self.offsets {
            out.push_str(&format!("{}\n", o));
        }
        out
    }

    /// Parse the text representation
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse::<f64>()
                    .map_err(|e| BmsError::Serialization {
                        message: format!("invalid offset value '{}': {}", l, e),
                    })
            });
        let reference_median = values.next().ok_or_else(|| BmsError::Serialization {
            message: "empty offsets file".to_string(),
        })??;
        let offsets = values.collect::<Result<Vec<_>>>()?;
        Ok(Self {
            reference_median,
            offsets,
        })
    }
}

/// Offsets file manager
pub struct OffsetStore {
    file_path: PathBuf,
    logger: StructuredLogger,
}

impl OffsetStore {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            logger: get_logger("persistence"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Load offsets for `channels` channels, if a matching file exists
    pub fn load(&self, channels: usize) -> Option<PersistedOffsets> {
        if !self.file_path.exists() {
            self.logger.info(&format!(
                "No offsets file at {}, calibration not restored",
                self.file_path.display()
            ));
            return None;
        }

        let parsed = std::fs::read_to_string(&self.file_path)
            .map_err(BmsError::from)
            .and_then(|text| PersistedOffsets::parse(&text));
        match parsed {
            Ok(p) if p.offsets.len() == channels => {
                self.logger.info(&format!(
                    "Loaded offsets for {} channels from {} (reference {:.2})",
                    channels,
                    self.file_path.display(),
                    p.reference_median
                ));
                Some(p)
            }
            Ok(p) => {
                self.logger.warn(&format!(
                    "Ignoring {}: {} offsets, expected {}",
                    self.file_path.display(),
                    p.offsets.len(),
                    channels
                ));
                None
            }
            Err(e) => {
                self.logger.warn(&format!(
                    "Ignoring unreadable offsets file {}: {}",
                    self.file_path.display(),
                    e
                ));
                None
            }
        }
    }

    /// Write offsets to disk
    pub fn save(&self, offsets: &PersistedOffsets) -> Result<()> {
        std::fs::write(&self.file_path, offsets.to_text())?;
        self.logger.info(&format!(
            "Saved offsets for {} channels to {}",
            offsets.offsets.len(),
            self.file_path.display()
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text() {
        let p = PersistedOffsets::parse("25.5\n0.5\n-0.25\n\n").unwrap();
        assert_eq!(p.reference_median, 25.5);
        assert_eq!(p.offsets, vec![0.5, -0.25]);
        assert!(PersistedOffsets::parse("").is_err());
        assert!(PersistedOffsets::parse("25.5\nabc\n").is_err());
    }

    #[test]
    fn test_text_round_trip() {
        let p = PersistedOffsets {
            reference_median: 24.75,
            offsets: vec![0.1, -0.3, 0.0],
        };
        assert_eq!(PersistedOffsets::parse(&p.to_text()).unwrap(), p);
    }
}
