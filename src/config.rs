use serde::{Deserialize, Serialize};

use crate::error::{CrfError, Result};

fn default_batch_first() -> bool {
    true
}

fn default_init_range() -> f64 {
    0.1
}

/// Construction parameters of a [`CRF`](crate::CRF).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrfConfig {
    /// Number of scored tags. START and END are added on top of it.
    pub tag_dim: usize,
    /// Tag id used to pad gold sequences.
    #[serde(default)]
    pub pad_idx: Option<usize>,
    /// `true` for (batch, time, ...) tensors, `false` for (time, batch, ...).
    #[serde(default = "default_batch_first")]
    pub batch_first: bool,
    /// Transitions are initialised uniformly in `[-init_range, init_range]`.
    #[serde(default = "default_init_range")]
    pub init_range: f64,
}

impl CrfConfig {
    pub fn new(tag_dim: usize) -> Self {
        Self {
            tag_dim,
            pad_idx: None,
            batch_first: default_batch_first(),
            init_range: default_init_range(),
        }
    }

    pub fn with_pad_idx(mut self, pad_idx: usize) -> Self {
        self.pad_idx = Some(pad_idx);
        self
    }

    pub fn with_batch_first(mut self, batch_first: bool) -> Self {
        self.batch_first = batch_first;
        self
    }

    pub fn with_init_range(mut self, init_range: f64) -> Self {
        self.init_range = init_range;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tag_dim == 0 {
            return Err(CrfError::config("tag_dim must be greater than 0"));
        }
        if !(self.init_range.is_finite() && self.init_range > 0.0) {
            return Err(CrfError::config(format!(
                "init_range must be a positive finite number, got {}",
                self.init_range
            )));
        }
        if self.tag_dim == 1 && self.scored_pad().is_some() {
            return Err(CrfError::config(
                "the pad tag cannot be the only scored tag",
            ));
        }
        Ok(())
    }

    /// Whether the pad id is one of the scored tags and must be kept out of paths.
    pub(crate) fn scored_pad(&self) -> Option<usize> {
        self.pad_idx.filter(|&p| p < self.tag_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_defaults() {
        let config = CrfConfig::new(7);
        assert_eq!(config.tag_dim, 7);
        assert_eq!(config.pad_idx, None);
        assert!(config.batch_first);
        assert_eq!(config.init_range, 0.1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_fills_defaults() -> Result<()> {
        let config: CrfConfig = serde_json::from_str(r#"{"tag_dim": 9, "pad_idx": 0}"#)?;
        assert_eq!(config, CrfConfig::new(9).with_pad_idx(0));

        let config: CrfConfig =
            serde_json::from_str(r#"{"tag_dim": 3, "batch_first": false, "init_range": 0.5}"#)?;
        assert!(!config.batch_first);
        assert_eq!(config.init_range, 0.5);

        let back: CrfConfig = serde_json::from_str(&serde_json::to_string(&config)?)?;
        assert_eq!(back, config);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(CrfConfig::new(0).validate().is_err());
        assert!(CrfConfig::new(3).with_init_range(0.0).validate().is_err());
        assert!(CrfConfig::new(3)
            .with_init_range(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_pad_as_only_tag() {
        assert!(CrfConfig::new(1).with_pad_idx(0).validate().is_err());
        assert!(CrfConfig::new(1).with_pad_idx(1).validate().is_ok());
        assert!(CrfConfig::new(2).with_pad_idx(0).validate().is_ok());
    }

    #[test]
    fn test_scored_pad() {
        assert_eq!(CrfConfig::new(4).scored_pad(), None);
        assert_eq!(CrfConfig::new(4).with_pad_idx(0).scored_pad(), Some(0));
        assert_eq!(CrfConfig::new(4).with_pad_idx(4).scored_pad(), None);
    }
}
