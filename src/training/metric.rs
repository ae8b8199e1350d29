use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor};
use std::fmt;

/// Running top-1 accuracy over every batch passed to [`Accuracy::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accuracy {
    num_correct: usize,
    num_inst: usize,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }

    /// `logits` is `[batch, num_classes]`, `labels` is `[batch]`.
    pub fn update<B: Backend>(&mut self, labels: Tensor<B, 1, Int>, logits: Tensor<B, 2>) {
        let [batch, _] = logits.dims();
        if batch == 0 {
            return;
        }
        let predicted = logits.argmax(1).reshape([batch]);
        let correct = predicted
            .equal(labels)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        self.update_counts(correct as usize, batch);
    }

    pub fn update_counts(&mut self, correct: usize, total: usize) {
        debug_assert!(correct <= total);
        self.num_correct += correct;
        self.num_inst += total;
    }

    /// Fraction of correct predictions, 0 when nothing has been seen.
    pub fn get(&self) -> f64 {
        if self.num_inst == 0 {
            return 0.0;
        }
        self.num_correct as f64 / self.num_inst as f64
    }

    pub fn num_correct(&self) -> usize {
        self.num_correct
    }

    pub fn num_inst(&self) -> usize {
        self.num_inst
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for Accuracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} ({}/{})", self.get(), self.num_correct, self.num_inst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn counts_argmax_hits() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats(
            [[0.1, 0.9, 0.0], [2.0, 1.0, 0.5], [0.0, 0.2, 0.3], [1.0, 3.0, 2.0]],
            &device,
        );
        let labels = Tensor::<TestBackend, 1, Int>::from_ints([1, 0, 1, 2], &device);

        let mut acc = Accuracy::new();
        acc.update(labels, logits);
        assert_eq!(acc.num_correct(), 2);
        assert_eq!(acc.num_inst(), 4);
        assert!((acc.get() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn accumulates_across_batches() {
        let mut acc = Accuracy::new();
        acc.update_counts(3, 4);
        acc.update_counts(1, 4);
        assert!((acc.get() - 0.5).abs() < 1e-12);
        assert_eq!(acc.to_string(), "0.5000 (4/8)");
        acc.reset();
        assert_eq!(acc.get(), 0.0);
        assert_eq!(acc.num_inst(), 0);
    }
}
