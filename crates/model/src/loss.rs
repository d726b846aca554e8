use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::ModelError;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Mean token-level cross entropy with an ignore label.
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    ignore_index: Option<i64>,
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self {
            ignore_index: Some(IGNORE_INDEX),
        }
    }
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<i64>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    /// `logits [.., vocab]` against integer `targets [..]`.
    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, ModelError> {
        let dims = logits.dims();
        let vocab_size = match dims.last() {
            Some(&vocab) if dims.len() >= 2 && vocab > 0 => vocab,
            _ => {
                return Err(ModelError::input(format!(
                    "cross entropy expects logits [.., vocab], got {dims:?}"
                )))
            }
        };
        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims {
            return Err(ModelError::input(format!(
                "targets {:?} do not match logits {dims:?}",
                targets.dims()
            )));
        }
        let token_count: usize = token_dims.iter().product();
        if token_count == 0 {
            return Err(ModelError::input("no tokens available for loss computation"));
        }
        if !targets.dtype().is_int() {
            return Err(ModelError::input(format!(
                "targets must be integers, got {:?}",
                targets.dtype()
            )));
        }

        let device = logits.device();
        let logits_flat = logits.to_dtype(DType::F32)?.reshape((token_count, vocab_size))?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1)?;

        let targets_flat = targets
            .to_device(device)?
            .to_dtype(DType::I64)?
            .reshape(token_count)?;
        let valid = match self.ignore_index {
            Some(ignore_index) => targets_flat.ne(ignore_index)?,
            None => Tensor::ones(token_count, DType::U8, device)?,
        };
        let total_tokens = valid.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()? as usize;
        if total_tokens == 0 {
            return Err(ModelError::input(
                "no valid tokens remain after applying ignore_index",
            ));
        }

        // ignored positions gather class 0 and are zeroed afterwards
        let safe_targets = valid.where_cond(&targets_flat, &targets_flat.zeros_like()?)?;
        let valid = valid.to_dtype(DType::F32)?;
        let nll = log_probs
            .gather(&safe_targets.unsqueeze(1)?, 1)?
            .squeeze(1)?
            .neg()?;
        let loss = ((nll * &valid)?.sum_all()? / total_tokens as f64)?;
        let average_loss = loss.to_scalar::<f32>()?;

        let correct = logits_flat
            .argmax(D::Minus1)?
            .to_dtype(DType::I64)?
            .eq(&targets_flat)?
            .to_dtype(DType::F32)?;
        let correct_tokens = (correct * &valid)?.sum_all()?.to_scalar::<f32>()? as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total_tokens,
                correct_tokens,
            },
        })
    }

    /// Next-token loss: position `t` predicts `labels[t + 1]`.
    ///
    /// `logits` is `[batch, seq, vocab]` and `labels` `[batch, seq]`.
    pub fn shifted(&self, logits: &Tensor, labels: &Tensor) -> Result<LossOutput, ModelError> {
        let (batch, seq, _) = logits.dims3()?;
        if labels.dims() != &[batch, seq] {
            return Err(ModelError::input(format!(
                "labels must be [{batch}, {seq}], got {:?}",
                labels.dims()
            )));
        }
        if seq < 2 {
            return Err(ModelError::input("shifted loss needs at least two positions"));
        }
        let shift_logits = logits.narrow(1, 0, seq - 1)?;
        let shift_labels = labels.narrow(1, 1, seq - 1)?;
        self.compute(&shift_logits, &shift_labels)
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar `f32` loss.
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone, Copy)]
pub struct LossMetrics {
    average_loss: f32,
    total_tokens: usize,
    correct_tokens: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn correct_tokens(&self) -> usize {
        self.correct_tokens
    }

    pub fn perplexity(&self) -> f32 {
        self.average_loss.exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn reference(logits: &[f32], vocab: usize, targets: &[i64]) -> f32 {
        let mut total = 0.0;
        let mut count = 0;
        for (row, &target) in logits.chunks(vocab).zip(targets) {
            if target == IGNORE_INDEX {
                continue;
            }
            let max = row.iter().cloned().fold(f32::MIN, f32::max);
            let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
            total += log_sum - row[target as usize];
            count += 1;
        }
        total / count as f32
    }

    #[test]
    fn ignored_labels_do_not_contribute() -> Result<(), ModelError> {
        let data: Vec<f32> = (0..12).map(|i| (i as f32 * 0.7).cos()).collect();
        let logits = Tensor::from_vec(data.clone(), (4, 3), &Device::Cpu)?;
        let targets = Tensor::new(&[2i64, IGNORE_INDEX, 0, 1], &Device::Cpu)?;
        let out = CrossEntropyLoss::new().compute(&logits, &targets)?;
        assert_eq!(out.metrics.total_tokens(), 3);
        let expected = reference(&data, 3, &[2, IGNORE_INDEX, 0, 1]);
        assert!((out.metrics.average_loss() - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn all_ignored_is_an_error() -> Result<(), ModelError> {
        let logits = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        let targets = Tensor::new(&[IGNORE_INDEX, IGNORE_INDEX], &Device::Cpu)?;
        assert!(CrossEntropyLoss::new().compute(&logits, &targets).is_err());
        Ok(())
    }
}
