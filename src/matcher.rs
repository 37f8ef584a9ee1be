use burn::{
    prelude::Backend,
    tensor::{Int, Tensor},
};

use crate::boxes::get_iou;
use crate::config::MatcherConfig;
use crate::error::{Result, RetinaError};

/// Legacy integer value of [`Assignment::Background`].
pub const BACKGROUND: i64 = -1;
/// Legacy integer value of [`Assignment::Ignore`].
pub const IGNORE: i64 = -2;

/// What an anchor is trained towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Assignment {
    /// Matched to nothing, a negative example for every class.
    Background,
    /// Excluded from both losses.
    Ignore,
    /// Matched to the ground truth box at this index.
    Foreground(usize),
}

impl Assignment {
    /// Decodes the integer form used by matchers that return index tensors: `-1` background,
    /// `-2` ignore, `k >= 0` ground truth `k`.
    pub fn from_legacy(value: i64) -> Result<Self> {
        match value {
            BACKGROUND => Ok(Assignment::Background),
            IGNORE => Ok(Assignment::Ignore),
            k if k >= 0 => Ok(Assignment::Foreground(k as usize)),
            k => Err(RetinaError::contract(format!("unknown match sentinel {k}"))),
        }
    }

    pub fn to_legacy(self) -> i64 {
        match self {
            Assignment::Background => BACKGROUND,
            Assignment::Ignore => IGNORE,
            Assignment::Foreground(k) => k as i64,
        }
    }

    pub fn is_foreground(&self) -> bool {
        matches!(self, Assignment::Foreground(_))
    }

    /// Background and foreground anchors take part in the classification loss.
    pub fn is_trained(&self) -> bool {
        !matches!(self, Assignment::Ignore)
    }
}

/// One [`Assignment`] per anchor, in anchor order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matches(pub Vec<Assignment>);

impl Matches {
    pub fn all_background(num_anchors: usize) -> Self {
        Matches(vec![Assignment::Background; num_anchors])
    }

    pub fn from_legacy(values: &[i64]) -> Result<Self> {
        values
            .iter()
            .map(|v| Assignment::from_legacy(*v))
            .collect::<Result<Vec<_>>>()
            .map(Matches)
    }

    pub fn to_legacy(&self) -> Vec<i64> {
        self.0.iter().map(|a| a.to_legacy()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Assignment> {
        self.0.iter()
    }

    /// `(anchor index, ground truth index)` of every foreground anchor.
    pub fn foreground(&self) -> (Vec<i64>, Vec<i64>) {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, a)| match a {
                Assignment::Foreground(k) => Some((i as i64, *k as i64)),
                _ => None,
            })
            .unzip()
    }

    pub fn num_foreground(&self) -> usize {
        self.0.iter().filter(|a| a.is_foreground()).count()
    }

    /// Checks the matcher contract against an image with `num_anchors` anchors and `num_gt`
    /// ground truth boxes.
    pub fn validate(&self, num_anchors: usize, num_gt: usize) -> Result<()> {
        if self.len() != num_anchors {
            return Err(RetinaError::contract(format!(
                "matcher returned {} assignments for {num_anchors} anchors",
                self.len()
            )));
        }

        if let Some(k) = self.0.iter().find_map(|a| match a {
            Assignment::Foreground(k) if *k >= num_gt => Some(*k),
            _ => None,
        }) {
            return Err(RetinaError::contract(format!(
                "matcher returned ground truth index {k} but the image has {num_gt} boxes"
            )));
        }

        if num_gt == 0 && self.0.iter().any(|a| *a != Assignment::Background) {
            return Err(RetinaError::contract(
                "anchors of an image without ground truth must all be background",
            ));
        }

        Ok(())
    }
}

/// Assigns every anchor of an image to the background, to be ignored, or to a ground truth box.
///
/// Implementations must return exactly one assignment per anchor and only background when there
/// is no ground truth. Many anchors may share the same ground truth box.
pub trait Matcher {
    fn assign<B: Backend>(&self, anchors: &Tensor<B, 2>, gt_boxes: &Tensor<B, 2>)
    -> Result<Matches>;
}

/// IoU threshold matcher.
///
/// Every anchor looks up the ground truth box it overlaps the most with:
///
/// - IoU below `background_threshold`: background,
/// - IoU at or above `foreground_threshold`: matched to that box,
/// - anything in between is ignored.
///
/// Relevant excerpt from
///
/// "Focal Loss for Dense Object Detection"
/// Authors: Tsung-Yi Lin, Priya Goyal, Ross Girshick, Kaiming He, Piotr Dollár
/// Link (official): https://arxiv.org/abs/1708.02002
///
/// Lin et al. - Pg 4
///
/// Specifically, anchors are assigned to ground-truth object boxes using an intersection-over-union
/// (IoU) threshold of 0.5; and to background if their IoU is in [0, 0.4). As each anchor is
/// assigned to at most one object box, we set the corresponding entry in its length K label vector
/// to 1 and all other entries to 0. If an anchor is unassigned, which may happen with overlap in
/// [0.4, 0.5), it is ignored during training.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IouMatcher {
    foreground_threshold: f32,
    background_threshold: f32,
    allow_low_quality_matches: bool,
}

impl Default for IouMatcher {
    fn default() -> Self {
        IouMatcher {
            foreground_threshold: 0.5,
            background_threshold: 0.4,
            allow_low_quality_matches: false,
        }
    }
}

impl IouMatcher {
    pub fn new(config: &MatcherConfig) -> Result<Self> {
        if config.background_threshold > config.foreground_threshold {
            return Err(RetinaError::config(format!(
                "background threshold {} is above the foreground threshold {}",
                config.background_threshold, config.foreground_threshold
            )));
        }

        Ok(IouMatcher {
            foreground_threshold: config.foreground_threshold,
            background_threshold: config.background_threshold,
            allow_low_quality_matches: config.allow_low_quality_matches,
        })
    }
}

impl Matcher for IouMatcher {
    fn assign<B: Backend>(
        &self,
        anchors: &Tensor<B, 2>,
        gt_boxes: &Tensor<B, 2>,
    ) -> Result<Matches> {
        let [num_anchors, _] = anchors.dims();
        let [num_gt, _] = gt_boxes.dims();

        // Ignoring needs a candidate box, without ground truth everything is background
        if num_gt == 0 || num_anchors == 0 {
            return Ok(Matches::all_background(num_anchors));
        }

        // Get IOU matrix
        //
        //                    Dim 1
        //                   Anchors
        //             ┌──────────────►
        //             │┌──────────────────┐
        //             ││                  │
        //    Dim 0    ││       IOU        │
        // Ground Truth││                  │
        //    Boxes    ││                  │
        //             ▼└──────────────────┘

        let iou = get_iou(gt_boxes.clone(), anchors.clone());

        // Best ground truth box for every anchor (maximum of each column)
        let (val, index) = iou.clone().max_dim_with_indices(0);
        let best_iou = to_f32_vec(val)?;
        let best_gt = to_i64_vec(index)?;

        let mut assignments: Vec<Assignment> = best_iou
            .iter()
            .zip(best_gt.iter())
            .map(|(iou, gt)| {
                if *iou < self.background_threshold {
                    Assignment::Background
                } else if *iou >= self.foreground_threshold {
                    Assignment::Foreground(*gt as usize)
                } else {
                    Assignment::Ignore
                }
            })
            .collect();

        if self.allow_low_quality_matches {
            // Best anchor for every ground truth box (maximum of each row) is always kept, so
            // that small or oddly shaped boxes still get a positive anchor
            let (val, index) = iou.max_dim_with_indices(1);
            let best_anchor_iou = to_f32_vec(val)?;
            let best_anchor = to_i64_vec(index)?;

            for (gt, (iou, anchor)) in best_anchor_iou.iter().zip(best_anchor.iter()).enumerate() {
                if *iou > 0.0 {
                    assignments[*anchor as usize] = Assignment::Foreground(gt);
                }
            }
        }

        Ok(Matches(assignments))
    }
}

fn to_f32_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f32>> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| RetinaError::Tensor(format!("{e:?}")))
}

fn to_i64_vec<B: Backend, const D: usize>(t: Tensor<B, D, Int>) -> Result<Vec<i64>> {
    t.into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| RetinaError::Tensor(format!("{e:?}")))
}
