use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::config::CrfConfig;
use crate::crf::CRF;
use crate::error::{CrfError, Result};
use crate::ops::sequence_mask;
use crate::Reduction;

/// Tag string reserved for padding.
pub const PAD_TAG: &str = "<pad>";

/// Bidirectional mapping between tag strings and tag ids.
#[derive(Debug, Clone)]
pub struct TagVocab {
    idx2tag: Vec<String>,
    tag2idx: HashMap<String, usize>,
    pad_idx: usize,
}

impl TagVocab {
    pub fn new(idx2tag: Vec<String>) -> Result<Self> {
        let mut tag2idx = HashMap::with_capacity(idx2tag.len());
        for (idx, tag) in idx2tag.iter().enumerate() {
            if tag2idx.insert(tag.clone(), idx).is_some() {
                return Err(CrfError::config(format!("duplicate tag `{}` in idx2tag", tag)));
            }
        }
        let pad_idx = *tag2idx
            .get(PAD_TAG)
            .ok_or_else(|| CrfError::config(format!("idx2tag must contain `{}`", PAD_TAG)))?;
        Ok(Self {
            idx2tag,
            tag2idx,
            pad_idx,
        })
    }

    pub fn pad_idx(&self) -> usize {
        self.pad_idx
    }

    pub fn voc_dim(&self) -> usize {
        self.idx2tag.len()
    }

    pub fn idx(&self, tag: &str) -> Result<usize> {
        self.tag2idx
            .get(tag)
            .copied()
            .ok_or_else(|| CrfError::UnknownTag(tag.to_string()))
    }

    pub fn tag(&self, idx: usize) -> Option<&str> {
        self.idx2tag.get(idx).map(String::as_str)
    }
}

fn default_in_drop_rate() -> f32 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrfDecoderConfig {
    /// Width of the encoder hidden states.
    pub in_dim: usize,
    #[serde(default = "default_in_drop_rate")]
    pub in_drop_rate: f32,
    pub idx2tag: Vec<String>,
}

impl CrfDecoderConfig {
    pub fn new(in_dim: usize, idx2tag: Vec<String>) -> Self {
        Self {
            in_dim,
            in_drop_rate: default_in_drop_rate(),
            idx2tag,
        }
    }

    pub fn with_in_drop_rate(mut self, in_drop_rate: f32) -> Self {
        self.in_drop_rate = in_drop_rate;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_dim == 0 {
            return Err(CrfError::config("in_dim must be greater than 0"));
        }
        if !(0.0..1.0).contains(&self.in_drop_rate) {
            return Err(CrfError::config(format!(
                "in_drop_rate must be in [0, 1), got {}",
                self.in_drop_rate
            )));
        }
        Ok(())
    }
}

/// Sequence-tagging head: dropout, a linear map from hidden states to tag
/// scores, and a batch-first CRF over the tag vocabulary.
pub struct CrfDecoder {
    vocab: TagVocab,
    dropout: Dropout,
    hid2logit: Linear,
    crf: CRF,
}

impl CrfDecoder {
    pub fn load(config: &CrfDecoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let vocab = TagVocab::new(config.idx2tag.clone())?;

        let hid2logit = candle_nn::linear(config.in_dim, vocab.voc_dim(), vb.pp("hid2logit"))?;
        let crf_config = CrfConfig::new(vocab.voc_dim())
            .with_pad_idx(vocab.pad_idx())
            .with_batch_first(true);
        let crf = CRF::load(&crf_config, vb.pp("crf"))?;

        tracing::debug!(
            in_dim = config.in_dim,
            voc_dim = vocab.voc_dim(),
            pad_idx = vocab.pad_idx(),
            "loaded CRF decoder"
        );
        Ok(Self {
            vocab,
            dropout: Dropout::new(config.in_drop_rate),
            hid2logit,
            crf,
        })
    }

    pub fn vocab(&self) -> &TagVocab {
        &self.vocab
    }

    pub fn crf(&self) -> &CRF {
        &self.crf
    }

    /// Gold tag ids padded with the pad index, shape (batch, max_len), and the
    /// matching `u8` mask.
    pub fn encode_tags(&self, batch: &[Vec<String>], device: &Device) -> Result<(Tensor, Tensor)> {
        let lengths: Vec<usize> = batch.iter().map(Vec::len).collect();
        let max_len = lengths.iter().copied().max().unwrap_or(0);
        let pad = self.vocab.pad_idx() as i64;

        let mut ids = Vec::with_capacity(batch.len() * max_len);
        for tags in batch {
            for tag in tags {
                ids.push(self.vocab.idx(tag)? as i64);
            }
            ids.extend(std::iter::repeat(pad).take(max_len - tags.len()));
        }

        let tags = Tensor::from_vec(ids, (batch.len(), max_len), device)?;
        let mask = sequence_mask(&lengths, max_len, device)?;
        Ok((tags, mask))
    }

    fn logits(&self, full_hidden: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.dropout.forward_t(full_hidden, train)?;
        Ok(self.hid2logit.forward(&hidden)?)
    }

    /// Per-sample CRF losses of the gold tags, shape (batch,).
    pub fn forward(
        &self,
        full_hidden: &Tensor,
        gold_tags: &Tensor,
        mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let logits = self.logits(full_hidden, train)?;
        self.crf.forward(&logits, gold_tags, Some(mask), Reduction::None)
    }

    /// Best tag strings of every sample, each cut to its valid length.
    pub fn decode(&self, full_hidden: &Tensor, mask: &Tensor) -> Result<Vec<Vec<String>>> {
        let logits = self.logits(full_hidden, false)?;
        let paths = self.crf.decode(&logits, Some(mask))?;
        paths
            .into_iter()
            .enumerate()
            .map(|(sample, path)| {
                path.into_iter()
                    .enumerate()
                    .map(|(position, idx)| {
                        self.vocab.tag(idx as usize).map(str::to_string).ok_or(
                            CrfError::InvalidTagId {
                                sample,
                                position,
                                tag: idx as i64,
                                tag_dim: self.vocab.voc_dim(),
                            },
                        )
                    })
                    .collect()
            })
            .collect()
    }

    /// Dtype of the head's parameters; hidden states must match it.
    pub fn dtype(&self) -> DType {
        self.crf.transitions().dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_nn::{Optimizer, VarMap, SGD};

    fn idx2tag() -> Vec<String> {
        ["<pad>", "O", "B-PER", "I-PER", "B-LOC", "I-LOC"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn tags(items: &[&[&str]]) -> Vec<Vec<String>> {
        items
            .iter()
            .map(|row| row.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_vocab() -> Result<()> {
        let vocab = TagVocab::new(idx2tag())?;
        assert_eq!(vocab.pad_idx(), 0);
        assert_eq!(vocab.voc_dim(), 6);
        assert_eq!(vocab.idx("B-LOC")?, 4);
        assert_eq!(vocab.tag(3), Some("I-PER"));
        assert_eq!(vocab.tag(6), None);
        assert!(matches!(vocab.idx("B-ORG"), Err(CrfError::UnknownTag(_))));
        Ok(())
    }

    #[test]
    fn test_vocab_rejects_bad_tag_lists() {
        let no_pad = vec!["O".to_string(), "B-PER".to_string()];
        assert!(matches!(TagVocab::new(no_pad), Err(CrfError::InvalidConfig(_))));

        let duplicate = vec!["<pad>".to_string(), "O".to_string(), "O".to_string()];
        assert!(matches!(TagVocab::new(duplicate), Err(CrfError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_serde_and_validate() -> Result<()> {
        let config: CrfDecoderConfig =
            serde_json::from_str(r#"{"in_dim": 8, "idx2tag": ["<pad>", "O"]}"#)?;
        assert_eq!(config.in_drop_rate, 0.5);
        assert_eq!(config, CrfDecoderConfig::new(8, vec!["<pad>".into(), "O".into()]));
        assert!(config.validate().is_ok());
        assert!(config.clone().with_in_drop_rate(1.0).validate().is_err());
        assert!(CrfDecoderConfig::new(0, idx2tag()).validate().is_err());
        Ok(())
    }

    #[test]
    fn test_load_registers_parameters() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = CrfDecoder::load(&CrfDecoderConfig::new(8, idx2tag()), vb)?;

        assert_eq!(decoder.crf().tag_dim(), 6);
        assert_eq!(decoder.crf().pad_idx(), Some(0));
        assert!(decoder.crf().batch_first());
        assert_eq!(decoder.dtype(), DType::F32);

        let vars = varmap.data().lock().unwrap();
        for name in ["hid2logit.weight", "hid2logit.bias", "crf.transitions"] {
            assert!(vars.contains_key(name), "missing {name}");
        }
        Ok(())
    }

    #[test]
    fn test_encode_tags() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = CrfDecoder::load(&CrfDecoderConfig::new(4, idx2tag()), vb)?;

        let batch = tags(&[&["B-PER", "I-PER", "O"], &["B-LOC"], &[]]);
        let (ids, mask) = decoder.encode_tags(&batch, &device)?;
        assert_eq!(
            ids.to_vec2::<i64>()?,
            vec![vec![2, 3, 1], vec![4, 0, 0], vec![0, 0, 0]]
        );
        assert_eq!(
            mask.to_vec2::<u8>()?,
            vec![vec![1, 1, 1], vec![1, 0, 0], vec![0, 0, 0]]
        );

        let result = decoder.encode_tags(&tags(&[&["B-ORG"]]), &device);
        assert!(matches!(result, Err(CrfError::UnknownTag(tag)) if tag == "B-ORG"));
        Ok(())
    }

    #[test]
    fn test_forward_and_decode() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = CrfDecoder::load(&CrfDecoderConfig::new(8, idx2tag()), vb)?;

        let batch = tags(&[&["B-PER", "I-PER", "O", "B-LOC"], &["O", "O"]]);
        let (gold, mask) = decoder.encode_tags(&batch, &device)?;
        let hidden = Tensor::randn(0.0_f32, 1.0, (2, 4, 8), &device)?;

        let losses = decoder.forward(&hidden, &gold, &mask, false)?;
        assert_eq!(losses.dims1()?, 2);
        assert!(losses.to_vec1::<f32>()?.iter().all(|&l| l >= 0.0));

        // without dropout the loss is deterministic
        let again = decoder.forward(&hidden, &gold, &mask, false)?;
        assert_eq!(losses.to_vec1::<f32>()?, again.to_vec1::<f32>()?);
        assert_eq!(decoder.forward(&hidden, &gold, &mask, true)?.dims1()?, 2);

        let decoded = decoder.decode(&hidden, &mask)?;
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].len(), 4);
        assert_eq!(decoded[1].len(), 2);
        assert!(decoded.iter().flatten().all(|tag| tag != PAD_TAG));
        Ok(())
    }

    #[test]
    fn test_training_fits_gold_tags() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = CrfDecoderConfig::new(6, idx2tag()).with_in_drop_rate(0.0);
        let decoder = CrfDecoder::load(&config, vb)?;
        let mut sgd = SGD::new(varmap.all_vars(), 0.1)?;

        let batch = tags(&[&["B-PER", "I-PER", "O"], &["B-LOC", "I-LOC", "O"]]);
        let (gold, mask) = decoder.encode_tags(&batch, &device)?;
        let hidden = Tensor::randn(0.0_f32, 1.0, (2, 3, 6), &device)?;

        let initial = decoder.forward(&hidden, &gold, &mask, true)?.mean_all()?.to_scalar::<f32>()?;
        for _ in 0..200 {
            let loss = decoder.forward(&hidden, &gold, &mask, true)?.mean_all()?;
            sgd.backward_step(&loss)?;
        }
        let trained = decoder.forward(&hidden, &gold, &mask, false)?.mean_all()?.to_scalar::<f32>()?;
        assert!(trained < initial, "{trained} >= {initial}");
        let decoded = decoder.decode(&hidden, &mask)?;
        assert!(decoded.iter().zip(&batch).all(|(d, g)| d.len() == g.len()));
        Ok(())
    }
}
