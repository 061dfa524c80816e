//! Decoder configuration.

use crate::error::{Error, Result};

/// Tunable options for [`LatticeDecoder`](crate::LatticeDecoder).
///
/// The defaults match common large-vocabulary setups; `beam` and
/// `max_active` are the usual speed/accuracy knobs, `lattice_beam` controls
/// lattice depth.
#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    /// Main decoding beam. Larger is slower and more accurate.
    pub beam: f32,
    /// Cap on active tokens per frame. Bounds worst-case cost and memory.
    pub max_active: usize,
    /// Floor on active tokens per frame. Guards against beam collapse.
    pub min_active: usize,
    /// Lattice generation beam. Larger gives slower decoding and deeper
    /// lattices.
    pub lattice_beam: f32,
    /// Interval, in frames, between back-pruning passes over the token
    /// network.
    pub prune_interval: usize,
    /// Slack added to the adaptive beam when the max/min-active cutoff
    /// overrides the beam cutoff. Larger is more accurate.
    pub beam_delta: f32,
    /// Sizing ratio for the active-token index: whenever the active count
    /// grows, the index is resized to `active_count * hash_ratio`.
    pub hash_ratio: f32,
    /// Multiplier applied to `lattice_beam` to obtain the convergence delta
    /// of intermediate back-prune passes.
    pub prune_scale: f32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            beam: 16.0,
            max_active: usize::MAX,
            min_active: 200,
            lattice_beam: 10.0,
            prune_interval: 25,
            beam_delta: 0.5,
            hash_ratio: 2.0,
            prune_scale: 0.1,
        }
    }
}

impl DecoderConfig {
    /// Validate the configuration, naming the offending option on failure.
    pub fn check(&self) -> Result<()> {
        let bad = |option, value: f64| Err(Error::InvalidConfig { option, value });
        if !(self.beam > 0.0) {
            return bad("beam", self.beam as f64);
        }
        if self.max_active <= 1 {
            return bad("max_active", self.max_active as f64);
        }
        if !(self.lattice_beam > 0.0) {
            return bad("lattice_beam", self.lattice_beam as f64);
        }
        if self.prune_interval == 0 {
            return bad("prune_interval", 0.0);
        }
        if !(self.beam_delta > 0.0) {
            return bad("beam_delta", self.beam_delta as f64);
        }
        if !(self.hash_ratio >= 1.0) {
            return bad("hash_ratio", self.hash_ratio as f64);
        }
        if !(self.prune_scale > 0.0 && self.prune_scale < 1.0) {
            return bad("prune_scale", self.prune_scale as f64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DecoderConfig::default().check().is_ok());
    }

    #[test]
    fn rejects_nonpositive_beam() {
        let config = DecoderConfig {
            beam: 0.0,
            ..Default::default()
        };

        match config.check() {
            Err(Error::InvalidConfig { option: "beam", .. }) => {}
            other => panic!("expected InvalidConfig for beam, got {other:?}"),
        }
    }

    #[test]
    fn rejects_max_active_of_one() {
        let config = DecoderConfig {
            max_active: 1,
            ..Default::default()
        };

        assert!(config.check().is_err());
    }

    #[test]
    fn rejects_hash_ratio_below_one() {
        let config = DecoderConfig {
            hash_ratio: 0.5,
            ..Default::default()
        };

        match config.check() {
            Err(Error::InvalidConfig {
                option: "hash_ratio",
                ..
            }) => {}
            other => panic!("expected InvalidConfig for hash_ratio, got {other:?}"),
        }
    }

    #[test]
    fn rejects_prune_scale_of_one() {
        let config = DecoderConfig {
            prune_scale: 1.0,
            ..Default::default()
        };

        assert!(config.check().is_err());
    }

    #[test]
    fn rejects_nan_beam() {
        let config = DecoderConfig {
            beam: f32::NAN,
            ..Default::default()
        };

        assert!(config.check().is_err());
    }
}
