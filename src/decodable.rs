//! Acoustic likelihood oracle.

use crate::graph::Label;
use ndarray::Array2;

/// Source of per-frame acoustic log-likelihoods.
///
/// Frame indexing is zero-based. The decoder treats `-log_likelihood` as the
/// acoustic cost of an emitting arc. Implementations may block internally
/// (neural evaluation, I/O); from the decoder's perspective every call is
/// synchronous.
pub trait Decodable {
    /// Number of frames currently available for scoring.
    ///
    /// May grow between calls as more input arrives, but must never shrink.
    fn num_frames_ready(&self) -> usize;

    /// Whether `frame` is the terminal frame of the utterance.
    ///
    /// Probed with `frame == -1` before any frame has been decoded; that
    /// must answer true only for an empty utterance whose input is finished.
    fn is_last_frame(&self, frame: isize) -> bool;

    /// Log-likelihood of input label `label` on `frame`.
    ///
    /// Takes `&mut self` because implementations typically evaluate and
    /// cache a whole frame of scores on first access.
    fn log_likelihood(&mut self, frame: usize, label: Label) -> f32;
}

/// A [`Decodable`] backed by a fully materialized score matrix.
///
/// Row `t` holds the log-likelihoods of frame `t`; column `j` holds input
/// label `j + 1` (label 0 is the epsilon label and is never scored).
#[derive(Debug, Clone)]
pub struct MatrixDecodable {
    loglikes: Array2<f32>,
}

impl MatrixDecodable {
    pub fn new(loglikes: Array2<f32>) -> Self {
        Self { loglikes }
    }

    pub fn num_frames(&self) -> usize {
        self.loglikes.nrows()
    }
}

impl Decodable for MatrixDecodable {
    fn num_frames_ready(&self) -> usize {
        self.loglikes.nrows()
    }

    fn is_last_frame(&self, frame: isize) -> bool {
        frame + 1 >= self.loglikes.nrows() as isize
    }

    fn log_likelihood(&mut self, frame: usize, label: Label) -> f32 {
        debug_assert!(label > 0, "epsilon label has no likelihood");
        self.loglikes[[frame, label as usize - 1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn labels_are_one_based_columns() {
        let mut decodable = MatrixDecodable::new(array![[0.5, -1.0], [0.0, -2.0]]);

        assert!((decodable.log_likelihood(0, 1) - 0.5).abs() < 0.001);
        assert!((decodable.log_likelihood(1, 2) + 2.0).abs() < 0.001);
    }

    #[test]
    fn reports_last_frame() {
        let decodable = MatrixDecodable::new(Array2::zeros((3, 2)));

        assert_eq!(decodable.num_frames_ready(), 3);
        assert!(!decodable.is_last_frame(1));
        assert!(decodable.is_last_frame(2));
    }

    #[test]
    fn empty_matrix_is_already_finished() {
        let decodable = MatrixDecodable::new(Array2::zeros((0, 2)));

        assert!(decodable.is_last_frame(-1));
    }
}
