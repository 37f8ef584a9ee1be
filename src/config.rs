use burn::config::Config;
use serde::{Deserialize, Serialize};
use {argh::FromArgs, std::fmt::Debug};

use crate::levels::PyramidLevel;

/// Anchor generation parameters for every pyramid level.
///
/// `sizes` and `aspect_ratios` are lists of per-level lists. A single inner list is broadcast to
/// every level, otherwise there must be one inner list per stride.
///
/// Defaults follow the RetinaNet paper: strides 8..128 on P3..P7, three octave scales of a
/// 32..512 base size and ratios {1:2, 1:1, 2:1}, A = 9 anchors per location.
#[derive(Config, Debug)]
pub struct AnchorConfig {
    /// Square root of the anchor areas, per level.
    #[config(default = "PyramidLevel::default_sizes()")]
    pub sizes: Vec<Vec<f32>>,
    /// Anchor height / width, per level.
    #[config(default = "PyramidLevel::default_aspect_ratios()")]
    pub aspect_ratios: Vec<Vec<f32>>,
    /// Pixels per grid cell, one per level.
    #[config(default = "PyramidLevel::default_strides()")]
    pub strides: Vec<usize>,
    /// Relative offset of the first anchor center from the image corner, in `[0, 1)`.
    #[config(default = 0.0)]
    pub offset: f32,
}

/// How the summed per-image losses are normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossNormalization {
    /// Divide by `max(1, foreground anchors)` of the image.
    ForegroundCount,
    /// Leave the per-image sums untouched, only the batch mean applies.
    BatchSize,
}

/// Focal loss and smooth-L1 parameters.
#[derive(Config, Debug)]
pub struct LossConfig {
    /// Number of object classes, background excluded.
    pub num_classes: usize,
    /// Class balance factor applied to positive targets, `1 - alpha` to negatives.
    #[config(default = 0.25)]
    pub alpha: f32,
    /// Focusing exponent.
    #[config(default = 2.0)]
    pub gamma: f32,
    /// Smooth-L1 transition point between the quadratic and linear branch.
    #[config(default = 0.1)]
    pub smooth_l1_beta: f32,
    #[config(default = "LossNormalization::ForegroundCount")]
    pub normalization: LossNormalization,
}

/// Thresholds of the IoU based anchor matcher.
#[derive(Config, Debug)]
pub struct MatcherConfig {
    /// Anchors with a best IoU at or above this value are foreground.
    #[config(default = 0.5)]
    pub foreground_threshold: f32,
    /// Anchors with a best IoU below this value are background, in between is ignored.
    #[config(default = 0.4)]
    pub background_threshold: f32,
    /// Let every ground truth box claim its best anchor even below `foreground_threshold`.
    #[config(default = false)]
    pub allow_low_quality_matches: bool,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Top-level command.
pub struct RetinaCmd {
    #[argh(subcommand)]
    pub commands: Commands,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Anchors(SubCommandAnchors),
    Loss(SubCommandLoss),
}

#[derive(FromArgs, PartialEq, Debug)]
/// Print the anchor layout for an input resolution
#[argh(subcommand, name = "anchors")]
pub struct SubCommandAnchors {
    #[argh(option, default = "512")]
    /// input image height in pixels
    pub height: usize,
    #[argh(option, default = "512")]
    /// input image width in pixels
    pub width: usize,
    #[argh(option)]
    /// anchor configuration json file, defaults to the RetinaNet layout
    pub config: Option<String>,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Compute the detection losses of a random batch of head outputs
#[argh(subcommand, name = "loss")]
pub struct SubCommandLoss {
    #[argh(option, default = "256")]
    /// input image height in pixels
    pub height: usize,
    #[argh(option, default = "256")]
    /// input image width in pixels
    pub width: usize,
    #[argh(option, default = "2")]
    /// number of images in the batch
    pub batch: usize,
    #[argh(option, default = "1")]
    /// seed of the random head outputs
    pub seed: u64,
    #[argh(option)]
    /// loss configuration json file, defaults to 80 classes
    pub loss_config: Option<String>,
    #[argh(option)]
    /// anchor configuration json file, defaults to the RetinaNet layout
    pub anchor_config: Option<String>,
}

/// Feature map size of every stride for an input of `height` x `width`, rounding up.
pub fn grid_sizes_for_input(strides: &[usize], height: usize, width: usize) -> Vec<[usize; 2]> {
    strides
        .iter()
        .map(|s| [height.div_ceil(*s), width.div_ceil(*s)])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_config_defaults() {
        let config = AnchorConfig::new();
        assert_eq!(config.strides, vec![8, 16, 32, 64, 128]);
        assert_eq!(config.sizes.len(), 5);
        assert_eq!(config.aspect_ratios, vec![vec![0.5, 1.0, 2.0]]);
        assert_eq!(config.offset, 0.0);
    }

    #[test]
    fn test_loss_config_defaults() {
        let config = LossConfig::new(80);
        assert_eq!(config.num_classes, 80);
        assert_eq!(config.alpha, 0.25);
        assert_eq!(config.gamma, 2.0);
        assert_eq!(config.smooth_l1_beta, 0.1);
        assert_eq!(config.normalization, LossNormalization::ForegroundCount);

        let config = config.with_normalization(LossNormalization::BatchSize);
        assert_eq!(config.normalization, LossNormalization::BatchSize);
    }

    #[test]
    fn test_matcher_config_defaults() {
        let config = MatcherConfig::new();
        assert_eq!(config.foreground_threshold, 0.5);
        assert_eq!(config.background_threshold, 0.4);
        assert!(!config.allow_low_quality_matches);
    }

    #[test]
    fn test_grid_sizes_round_up() {
        assert_eq!(
            grid_sizes_for_input(&[8, 16, 128], 300, 512),
            vec![[38, 64], [19, 32], [3, 4]]
        );
    }

    #[test]
    fn test_cli_parses_loss_subcommand() {
        let cmd = RetinaCmd::from_args(&["retina-core"], &["loss", "--batch", "4", "--seed", "7"])
            .unwrap();
        match cmd.commands {
            Commands::Loss(loss) => {
                assert_eq!(loss.batch, 4);
                assert_eq!(loss.seed, 7);
                assert_eq!(loss.height, 256);
                assert!(loss.loss_config.is_none());
            }
            Commands::Anchors(_) => panic!("expected the loss subcommand"),
        }
    }
}
