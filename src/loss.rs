use std::collections::BTreeMap;

use burn::prelude::*;
use burn::tensor::{
    TensorData,
    activation::{log_sigmoid, sigmoid},
};
use tracing::debug;

use crate::boxes::BoxCoder;
use crate::config::{LossConfig, LossNormalization, MatcherConfig};
use crate::error::{Result, RetinaError};
use crate::matcher::{Assignment, IouMatcher, Matcher, Matches};

pub const CLASSIFICATION_LOSS: &str = "classification_loss";
pub const REGRESSION_LOSS: &str = "regression_loss";

/// Ground truth of one image, boxes in the pixel space of the anchors and 0-based class labels.
#[derive(Debug, Clone)]
pub struct GroundTruth<B: Backend> {
    boxes: Tensor<B, 2>,
    labels: Vec<usize>,
}

impl<B: Backend> GroundTruth<B> {
    /// # Errors
    ///
    /// [`RetinaError::ContractViolation`] when `boxes` is not `[labels.len(), 4]` or holds a box
    /// with `x2 <= x1`, `y2 <= y1` or a non finite coordinate. Such a box has no log-space
    /// regression target.
    pub fn new(boxes: Tensor<B, 2>, labels: Vec<usize>) -> Result<Self> {
        let [n, c] = boxes.dims();
        if c != 4 || n != labels.len() {
            return Err(RetinaError::contract(format!(
                "ground truth boxes of shape [{n}, {c}] do not match {} labels",
                labels.len()
            )));
        }

        let values = boxes
            .to_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| RetinaError::Tensor(format!("{e:?}")))?;

        for (i, b) in values.chunks_exact(4).enumerate() {
            let [x1, y1, x2, y2] = [b[0], b[1], b[2], b[3]];
            if !b.iter().all(|v| v.is_finite()) || x2 <= x1 || y2 <= y1 {
                return Err(RetinaError::contract(format!(
                    "ground truth box {i} [{x1}, {y1}, {x2}, {y2}] is degenerate"
                )));
            }
        }

        Ok(GroundTruth { boxes, labels })
    }

    /// An image without objects.
    pub fn empty(device: &B::Device) -> Self {
        GroundTruth {
            boxes: Tensor::zeros([0, 4], device),
            labels: vec![],
        }
    }

    pub fn boxes(&self) -> &Tensor<B, 2> {
        &self.boxes
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Raw detection head outputs for a batch, flattened in anchor order.
#[derive(Debug, Clone)]
pub struct HeadOutputs<B: Backend> {
    /// Classification logits `[batch, anchors, num_classes]`.
    pub cls_preds: Tensor<B, 3>,
    /// Box regression deltas `[batch, anchors, 4]`.
    pub bbox_preds: Tensor<B, 3>,
}

impl<B: Backend> HeadOutputs<B> {
    /// Concatenates per level head outputs along the anchor dimension, levels in ascending order.
    pub fn from_levels(cls_levels: Vec<Tensor<B, 3>>, bbox_levels: Vec<Tensor<B, 3>>) -> Self {
        HeadOutputs {
            cls_preds: Tensor::cat(cls_levels, 1),
            bbox_preds: Tensor::cat(bbox_levels, 1),
        }
    }
}

/// Normalized losses of a single image.
#[derive(Debug, Clone)]
pub struct ImageLosses<B: Backend> {
    pub classification: Tensor<B, 1>,
    pub regression: Tensor<B, 1>,
    pub num_foreground: usize,
}

/// Batch averaged losses.
#[derive(Debug, Clone)]
pub struct DetectionLosses<B: Backend> {
    pub classification: Tensor<B, 1>,
    pub regression: Tensor<B, 1>,
}

impl<B: Backend> DetectionLosses<B> {
    /// Sum of both losses, the training objective.
    pub fn total(&self) -> Tensor<B, 1> {
        self.classification.clone() + self.regression.clone()
    }

    /// The losses keyed by `classification_loss` and `regression_loss`.
    pub fn into_map(self) -> BTreeMap<&'static str, Tensor<B, 1>> {
        BTreeMap::from([
            (CLASSIFICATION_LOSS, self.classification),
            (REGRESSION_LOSS, self.regression),
        ])
    }
}

/// Focal loss, summed over all elements.
///
/// Relevant excerpt from
///
/// "Focal Loss for Dense Object Detection"
/// Authors: Tsung-Yi Lin, Priya Goyal, Ross Girshick, Kaiming He, Piotr Dollár
/// Link (official): https://arxiv.org/abs/1708.02002
///
/// Lin et al. - Pg 3, Focal Loss Definition
///
/// While α balances the importance of positive/negative examples, it does not differentiate
/// between easy/hard examples. Instead, we propose to reshape the loss function to down-weight
/// easy examples and thus focus training on hard negatives. More formally, we propose to add a
/// modulating factor (1 − pt)^γ to the cross entropy loss, with tunable focusing parameter γ ≥ 0.
///
/// ```text
///                         γ
/// FL(p ) = -α  ⋅ (1 - p )  ⋅ log(p )
///     t      t         t          t
/// ```
///
/// The modulating factor is computed from a detached copy of the logits, gradients only flow
/// through the binary cross entropy term.
///
/// # Arguments
/// * `pred` - Logits of shape `[num_anchors, num_classes]`.
/// * `target` - Binary targets of the same shape.
/// * `alpha` - Weight of the positive targets, negatives are weighted `1 - alpha`.
/// * `gamma` - Focusing exponent.
pub fn focal_loss<B: Backend>(
    pred: Tensor<B, 2>,
    target: Tensor<B, 2>,
    alpha: f32,
    gamma: f32,
) -> Tensor<B, 1> {
    let p = sigmoid(pred.clone().detach());
    let neg_target = target.clone().neg().add_scalar(1.0);

    // 1 - p_t
    let weights = target.clone() * p.clone().neg().add_scalar(1.0) + neg_target.clone() * p;
    let alphas = target.clone().mul_scalar(alpha) + neg_target.clone().mul_scalar(1.0 - alpha);
    let weights = weights.powf_scalar(gamma) * alphas;

    // Binary cross entropy with logits
    //
    // -(t ⋅ log σ(x) + (1 - t) ⋅ log σ(-x))
    //
    let bce = (target * log_sigmoid(pred.clone()) + neg_target * log_sigmoid(pred.neg())).neg();

    (bce * weights).sum()
}

/// Smooth L1 distance, summed over all elements.
///
/// ```text
///              ⎧ 0.5 ⋅ d² / β   if d < β
/// smooth_l1 =  ⎨
///              ⎩ d - 0.5 ⋅ β    otherwise
/// ```
///
/// where d = |input - target|. A `beta` close to zero degrades to the plain L1 distance.
pub fn smooth_l1_loss<B: Backend>(
    input: Tensor<B, 2>,
    target: Tensor<B, 2>,
    beta: f32,
) -> Tensor<B, 1> {
    let n = (input - target).abs();

    if beta < 1e-5 {
        return n.sum();
    }

    let cond = n.clone().lower_elem(beta);
    let quadratic = n.clone().powf_scalar(2.0).mul_scalar(0.5 / beta);
    let linear = n.sub_scalar(0.5 * beta);

    linear.mask_where(cond, quadratic).sum()
}

/// Builds the classification targets of an image.
///
/// Ignored anchors are dropped. Every kept anchor gets a row of `num_classes` zeros, foreground
/// anchors additionally get a 1 in the column of their ground truth label. Background rows stay
/// all zero, a negative example for every class.
///
/// # Returns
///
/// The kept anchor indices and the row-major `[kept, num_classes]` target values.
pub fn classification_targets(
    matches: &Matches,
    labels: &[usize],
    num_classes: usize,
) -> Result<(Vec<i64>, Vec<f32>)> {
    let mut keep = Vec::with_capacity(matches.len());
    let mut targets = Vec::with_capacity(matches.len() * num_classes);

    for (i, assignment) in matches.iter().enumerate() {
        let class = match assignment {
            Assignment::Ignore => continue,
            Assignment::Background => None,
            Assignment::Foreground(k) => {
                let label = *labels.get(*k).ok_or_else(|| {
                    RetinaError::contract(format!(
                        "ground truth index {k} out of range for {} labels",
                        labels.len()
                    ))
                })?;
                if label >= num_classes {
                    return Err(RetinaError::contract(format!(
                        "label {label} out of range for {num_classes} classes"
                    )));
                }
                Some(label)
            }
        };

        keep.push(i as i64);
        let row = targets.len();
        targets.resize(row + num_classes, 0.0);
        if let Some(class) = class {
            targets[row + class] = 1.0;
        }
    }

    Ok((keep, targets))
}

fn index_tensor<B: Backend>(indices: &[i64], device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::from_data(TensorData::new(indices.to_vec(), [indices.len()]), device)
}

/// Classification and box regression losses of a RetinaNet style detector.
///
/// For every image the anchors are matched to the ground truth, the foreground anchors are
/// trained to regress the encoded ground truth boxes with a smooth L1 loss, and every anchor that
/// is not ignored is trained with a sigmoid focal loss. Both image losses are divided by the
/// number of foreground anchors (at least 1) and averaged over the batch.
///
/// Relevant excerpt from
///
/// "Focal Loss for Dense Object Detection"
/// Authors: Tsung-Yi Lin, Priya Goyal, Ross Girshick, Kaiming He, Piotr Dollár
/// Link (official): https://arxiv.org/abs/1708.02002
///
/// Lin et al. - Pg 5, Inference and Training
///
/// The total focal loss of an image is computed as the sum of the focal loss over all ∼100k
/// anchors, normalized by the number of anchors assigned to a ground-truth box. We perform the
/// normalization by the number of assigned anchors, not total anchors, since the vast majority of
/// anchors are easy negatives and receive negligible loss values under the focal loss.
///
#[derive(Debug, Clone)]
pub struct RetinaNetLoss<M: Matcher = IouMatcher> {
    num_classes: usize,
    alpha: f32,
    gamma: f32,
    smooth_l1_beta: f32,
    normalization: LossNormalization,
    coder: BoxCoder,
    matcher: M,
}

impl RetinaNetLoss<IouMatcher> {
    /// Loss with the default box coder and an IoU matcher built from `matcher`.
    pub fn from_configs(config: &LossConfig, matcher: &MatcherConfig) -> Result<Self> {
        Self::new(config, BoxCoder::default(), IouMatcher::new(matcher)?)
    }
}

impl<M: Matcher> RetinaNetLoss<M> {
    /// # Errors
    ///
    /// [`RetinaError::Configuration`] for zero classes, `alpha` outside of `[0, 1]` or a
    /// negative `gamma` / `smooth_l1_beta`.
    pub fn new(config: &LossConfig, coder: BoxCoder, matcher: M) -> Result<Self> {
        if config.num_classes == 0 {
            return Err(RetinaError::config("the loss needs at least one class"));
        }
        if !(0.0..=1.0).contains(&config.alpha) {
            return Err(RetinaError::config(format!(
                "focal loss alpha has to be in [0, 1], got {}",
                config.alpha
            )));
        }
        if config.gamma.is_nan() || config.gamma < 0.0 {
            return Err(RetinaError::config(format!(
                "focal loss gamma has to be non negative, got {}",
                config.gamma
            )));
        }
        if config.smooth_l1_beta.is_nan() || config.smooth_l1_beta < 0.0 {
            return Err(RetinaError::config(format!(
                "smooth l1 beta has to be non negative, got {}",
                config.smooth_l1_beta
            )));
        }

        Ok(RetinaNetLoss {
            num_classes: config.num_classes,
            alpha: config.alpha,
            gamma: config.gamma,
            smooth_l1_beta: config.smooth_l1_beta,
            normalization: config.normalization,
            coder,
            matcher,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn coder(&self) -> &BoxCoder {
        &self.coder
    }

    /// Computes the losses of one image.
    ///
    /// # Arguments
    /// - `anchors`: Anchors of the image `[N, 4]`.
    /// - `cls_pred`: Classification logits `[N, num_classes]`.
    /// - `bbox_pred`: Box regression deltas `[N, 4]`.
    /// - `gt`: Ground truth of the image, possibly empty.
    ///
    /// # Errors
    ///
    /// [`RetinaError::Configuration`] when the prediction shapes do not line up with the anchors,
    /// [`RetinaError::ContractViolation`] when the matcher or the labels break their contract.
    pub fn calc_loss<B: Backend>(
        &self,
        anchors: &Tensor<B, 2>,
        cls_pred: Tensor<B, 2>,
        bbox_pred: Tensor<B, 2>,
        gt: &GroundTruth<B>,
    ) -> Result<ImageLosses<B>> {
        let [num_anchors, anchor_width] = anchors.dims();
        let cls_dims = cls_pred.dims();
        let bbox_dims = bbox_pred.dims();

        if anchor_width != 4
            || cls_dims != [num_anchors, self.num_classes]
            || bbox_dims != [num_anchors, 4]
        {
            return Err(RetinaError::config(format!(
                "predictions {cls_dims:?} / {bbox_dims:?} do not match {num_anchors} anchors and {} classes",
                self.num_classes
            )));
        }

        let device = cls_pred.device();

        // Match anchors with the ground truth to get `background`, `ignore` and `foreground`
        let matches = self.matcher.assign(anchors, gt.boxes())?;
        matches.validate(num_anchors, gt.len())?;

        let (fg_anchors, fg_gt) = matches.foreground();
        let num_foreground = fg_anchors.len();

        // Box regression is only trained on foreground anchors, an image without any contributes
        // a true zero
        let regression = if num_foreground == 0 {
            Tensor::zeros([1], &device)
        } else {
            let fg_index = index_tensor::<B>(&fg_anchors, &device);
            let gt_index = index_tensor::<B>(&fg_gt, &device);

            let matched_gt = gt.boxes().clone().select(0, gt_index);
            let matched_anchors = anchors.clone().select(0, fg_index.clone());
            let targets = self.coder.encode(matched_gt, matched_anchors);

            smooth_l1_loss(bbox_pred.select(0, fg_index), targets, self.smooth_l1_beta)
        };

        let (keep, targets) = classification_targets(&matches, gt.labels(), self.num_classes)?;

        let classification = if keep.is_empty() {
            Tensor::zeros([1], &device)
        } else {
            let targets = Tensor::<B, 2>::from_data(
                TensorData::new(targets, [keep.len(), self.num_classes]),
                &device,
            );
            let keep_index = index_tensor::<B>(&keep, &device);

            focal_loss(
                cls_pred.select(0, keep_index),
                targets,
                self.alpha,
                self.gamma,
            )
        };

        debug!(
            anchors = num_anchors,
            ground_truth = gt.len(),
            foreground = num_foreground,
            ignored = num_anchors - keep.len(),
            "matched image"
        );

        let normalizer = match self.normalization {
            LossNormalization::ForegroundCount => num_foreground.max(1) as f32,
            LossNormalization::BatchSize => 1.0,
        };

        Ok(ImageLosses {
            classification: classification.div_scalar(normalizer),
            regression: regression.div_scalar(normalizer),
            num_foreground,
        })
    }

    /// Computes the batch averaged losses.
    ///
    /// # Arguments
    /// - `anchors`: Anchors of every image, as returned by `AnchorGenerator::forward`.
    /// - `head_outputs`: Head outputs of the batch, `[batch, N, num_classes]` / `[batch, N, 4]`.
    /// - `targets`: Ground truth of every image.
    ///
    /// # Returns
    ///
    /// The arithmetic mean of the per image losses, every image weighted equally.
    pub fn forward<B: Backend>(
        &self,
        anchors: &[Tensor<B, 2>],
        head_outputs: HeadOutputs<B>,
        targets: &[GroundTruth<B>],
    ) -> Result<DetectionLosses<B>> {
        let [batch_size, _, _] = head_outputs.cls_preds.dims();
        let [bbox_batch, _, _] = head_outputs.bbox_preds.dims();

        if batch_size == 0 {
            return Err(RetinaError::config("cannot compute the loss of an empty batch"));
        }
        if bbox_batch != batch_size || anchors.len() != batch_size || targets.len() != batch_size {
            return Err(RetinaError::config(format!(
                "batch of {batch_size} class predictions, {bbox_batch} box predictions, {} anchor sets and {} targets",
                anchors.len(),
                targets.len()
            )));
        }

        let device = head_outputs.cls_preds.device();
        let mut cls_losses = Tensor::<B, 1>::zeros([1], &device);
        let mut bb_losses = Tensor::<B, 1>::zeros([1], &device);

        for (i, (ancs, targs)) in anchors.iter().zip(targets.iter()).enumerate() {
            let cls_pred: Tensor<B, 2> = head_outputs.cls_preds.clone().narrow(0, i, 1).squeeze(0);
            let bb_pred: Tensor<B, 2> = head_outputs.bbox_preds.clone().narrow(0, i, 1).squeeze(0);

            let losses = self.calc_loss(ancs, cls_pred, bb_pred, targs)?;

            cls_losses = cls_losses + losses.classification;
            bb_losses = bb_losses + losses.regression;
        }

        Ok(DetectionLosses {
            classification: cls_losses.div_scalar(batch_size as f32),
            regression: bb_losses.div_scalar(batch_size as f32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchors::AnchorGenerator;
    use crate::config::AnchorConfig;
    use crate::debug::assert_approx_eq;
    use burn::{
        backend::{Autodiff, NdArray, ndarray::NdArrayDevice},
        tensor::{Tolerance, cast::ToElement, ops::FloatElem},
    };

    type B = NdArray<f32>;
    type FT = FloatElem<B>;

    const LN2: f32 = std::f32::consts::LN_2;
    // focal weight of a zero logit: 0.5^2 times alpha (positive) or 1 - alpha (negative)
    const POS_ZERO: f32 = 0.25 * 0.25 * LN2;
    const NEG_ZERO: f32 = 0.25 * 0.75 * LN2;

    fn scalar<BK: Backend>(t: Tensor<BK, 1>) -> f32 {
        t.into_scalar().to_f32()
    }

    /// 2x2 grid, stride 16, one 32x32 anchor per cell centered at (8,8), (24,8), (8,24), (24,24)
    fn grid_anchors<BK: Backend>(device: &BK::Device) -> Tensor<BK, 2> {
        let config = AnchorConfig::new()
            .with_strides(vec![16])
            .with_sizes(vec![vec![32.0]])
            .with_aspect_ratios(vec![vec![1.0]])
            .with_offset(0.5);
        AnchorGenerator::new(&config)
            .unwrap()
            .generate::<BK>(&[[2, 2]], device)
            .unwrap()
    }

    fn loss(num_classes: usize) -> RetinaNetLoss {
        RetinaNetLoss::from_configs(&LossConfig::new(num_classes), &MatcherConfig::new()).unwrap()
    }

    #[test]
    fn test_focal_loss_zero_logits() {
        let device = &NdArrayDevice::default();
        let pred = Tensor::<B, 2>::zeros([1, 2], device);
        let target = Tensor::<B, 2>::from_data([[1.0, 0.0]], device);

        let value = scalar(focal_loss(pred, target, 0.25, 2.0));

        assert_approx_eq(&value, &(POS_ZERO + NEG_ZERO), 1e-5);
    }

    #[test]
    fn test_focal_loss_down_weights_easy_examples() {
        let device = &NdArrayDevice::default();
        let target = Tensor::<B, 2>::from_data([[1.0]], device);

        let easy = scalar(focal_loss(
            Tensor::<B, 2>::from_data([[4.0]], device),
            target.clone(),
            0.25,
            2.0,
        ));
        let hard = scalar(focal_loss(
            Tensor::<B, 2>::from_data([[-4.0]], device),
            target.clone(),
            0.25,
            2.0,
        ));

        assert!(easy < hard * 1e-3, "easy {easy} hard {hard}");

        // gamma 0 and alpha 0.5 is half of the plain binary cross entropy
        let bce = scalar(focal_loss(
            Tensor::<B, 2>::from_data([[-4.0]], device),
            target,
            0.5,
            0.0,
        ));
        assert_approx_eq(&bce, &(0.5 * (1.0 + 4f32.exp()).ln()), 1e-4);
    }

    #[test]
    fn test_focal_loss_large_logits_are_finite() {
        let device = &NdArrayDevice::default();
        let pred = Tensor::<B, 2>::from_data([[200.0, -200.0]], device);
        let target = Tensor::<B, 2>::from_data([[0.0, 1.0]], device);

        let value = scalar(focal_loss(pred, target, 0.25, 2.0));

        assert!(value.is_finite());
        assert!(value > 100.0);
    }

    #[test]
    fn test_smooth_l1_branches() {
        let device = &NdArrayDevice::default();
        let input = Tensor::<B, 2>::zeros([1, 4], device);
        let target = Tensor::<B, 2>::from_data([[0.05, 0.2, -1.0, 0.0]], device);

        let value = scalar(smooth_l1_loss(input.clone(), target.clone(), 0.1));
        // 0.5 * 0.05² / 0.1 + (0.2 - 0.05) + (1.0 - 0.05)
        assert_approx_eq(&value, &1.1125, 1e-5);

        let l1 = scalar(smooth_l1_loss(input, target, 0.0));
        assert_approx_eq(&l1, &1.25, 1e-5);
    }

    #[test]
    fn test_classification_targets() {
        let matches = Matches(vec![
            Assignment::Foreground(0),
            Assignment::Background,
            Assignment::Ignore,
            Assignment::Foreground(1),
        ]);

        let (keep, targets) = classification_targets(&matches, &[0, 2], 3).unwrap();

        assert_eq!(keep, vec![0, 1, 3]);
        assert_eq!(
            targets,
            vec![
                1.0, 0.0, 0.0, // label 0
                0.0, 0.0, 0.0, // background
                0.0, 0.0, 1.0, // label 2
            ]
        );

        assert!(matches!(
            classification_targets(&matches, &[0, 3], 3),
            Err(RetinaError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_single_foreground_anchor() {
        let device = &NdArrayDevice::default();
        let anchors = grid_anchors::<B>(device);
        let gt = GroundTruth::new(
            Tensor::<B, 2>::from_data([[-8.0, -8.0, 24.0, 24.0]], device),
            vec![0],
        )
        .unwrap();

        let cls_pred = Tensor::<B, 2>::zeros([4, 3], device);
        let bbox_pred = Tensor::<B, 2>::from_data(
            [
                [0.05, 0.2, -1.0, 0.0],
                [9.0, 9.0, 9.0, 9.0],
                [9.0, 9.0, 9.0, 9.0],
                [9.0, 9.0, 9.0, 9.0],
            ],
            device,
        );

        let losses = loss(3).calc_loss(&anchors, cls_pred, bbox_pred, &gt).unwrap();

        assert_eq!(losses.num_foreground, 1);
        // target [1, 0, 0] for the matched anchor, [0, 0, 0] for the three others
        assert_approx_eq(
            &scalar(losses.classification),
            &(POS_ZERO + 11.0 * NEG_ZERO),
            1e-5,
        );
        // identical boxes encode to zero, only the matched anchor's deltas count
        assert_approx_eq(&scalar(losses.regression), &1.1125, 1e-5);
    }

    #[test]
    fn test_no_ground_truth() {
        let device = &NdArrayDevice::default();
        let anchors = grid_anchors::<B>(device);
        let gt = GroundTruth::<B>::empty(device);

        let losses = loss(3)
            .calc_loss(
                &anchors,
                Tensor::zeros([4, 3], device),
                Tensor::ones([4, 4], device),
                &gt,
            )
            .unwrap();

        assert_eq!(losses.num_foreground, 0);
        assert_eq!(scalar(losses.regression), 0.0);

        let classification = scalar(losses.classification);
        assert!(classification.is_finite());
        assert_approx_eq(&classification, &(12.0 * NEG_ZERO), 1e-5);
    }

    #[test]
    fn test_no_foreground_is_finite() {
        let device = &NdArrayDevice::default();
        let anchors = grid_anchors::<B>(device);
        // far away from every anchor
        let gt = GroundTruth::new(
            Tensor::<B, 2>::from_data([[500.0, 500.0, 520.0, 520.0]], device),
            vec![1],
        )
        .unwrap();

        let losses = loss(3)
            .calc_loss(
                &anchors,
                Tensor::ones([4, 3], device),
                Tensor::ones([4, 4], device),
                &gt,
            )
            .unwrap();

        assert_eq!(losses.num_foreground, 0);
        assert_eq!(scalar(losses.regression), 0.0);
        assert!(scalar(losses.classification).is_finite());
    }

    #[test]
    fn test_normalization_modes() {
        let device = &NdArrayDevice::default();
        let anchors = grid_anchors::<B>(device);
        // IoU 0.6 with the two top anchors
        let gt = GroundTruth::new(
            Tensor::<B, 2>::from_data([[0.0, -8.0, 32.0, 24.0]], device),
            vec![1],
        )
        .unwrap();

        let run = |normalization| {
            let config = LossConfig::new(3).with_normalization(normalization);
            RetinaNetLoss::from_configs(&config, &MatcherConfig::new())
                .unwrap()
                .calc_loss(
                    &anchors,
                    Tensor::zeros([4, 3], device),
                    Tensor::zeros([4, 4], device),
                    &gt,
                )
                .unwrap()
        };

        let per_foreground = run(LossNormalization::ForegroundCount);
        let unnormalized = run(LossNormalization::BatchSize);

        assert_eq!(per_foreground.num_foreground, 2);

        // 2 * (pos + 2 neg) + 2 * 3 neg
        let cls_sum = 2.0 * POS_ZERO + 10.0 * NEG_ZERO;
        assert_approx_eq(&scalar(unnormalized.classification), &cls_sum, 1e-5);
        assert_approx_eq(&scalar(per_foreground.classification), &(cls_sum / 2.0), 1e-5);

        // tx = ±10 * 8 / 32 for both anchors, linear branch 2.5 - 0.05
        assert_approx_eq(&scalar(unnormalized.regression), &4.9, 1e-4);
        assert_approx_eq(&scalar(per_foreground.regression), &2.45, 1e-4);
    }

    #[test]
    fn test_batch_mean() {
        let device = &NdArrayDevice::default();
        let anchors = grid_anchors::<B>(device);

        let targets = vec![
            GroundTruth::new(
                Tensor::<B, 2>::from_data([[-8.0, -8.0, 24.0, 24.0]], device),
                vec![0],
            )
            .unwrap(),
            GroundTruth::empty(device),
        ];

        let bbox_image = Tensor::<B, 2>::from_data(
            [
                [0.05, 0.2, -1.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
            ],
            device,
        );
        let head = HeadOutputs {
            cls_preds: Tensor::zeros([2, 4, 3], device),
            bbox_preds: Tensor::stack(vec![bbox_image.clone(), bbox_image], 0),
        };

        let losses = loss(3)
            .forward(&[anchors.clone(), anchors], head, &targets)
            .unwrap();

        let image_a = POS_ZERO + 11.0 * NEG_ZERO;
        let image_b = 12.0 * NEG_ZERO;
        let total = scalar(losses.total());
        let map = losses.into_map();

        assert_approx_eq(
            &scalar(map[CLASSIFICATION_LOSS].clone()),
            &((image_a + image_b) / 2.0),
            1e-5,
        );
        assert_approx_eq(&scalar(map[REGRESSION_LOSS].clone()), &(1.1125 / 2.0), 1e-5);
        assert_approx_eq(&total, &((image_a + image_b + 1.1125) / 2.0), 1e-5);
    }

    #[test]
    fn test_head_outputs_from_levels() {
        let device = &NdArrayDevice::default();
        let head = HeadOutputs::<B>::from_levels(
            vec![
                Tensor::zeros([2, 36, 3], device),
                Tensor::ones([2, 9, 3], device),
            ],
            vec![Tensor::zeros([2, 36, 4], device), Tensor::zeros([2, 9, 4], device)],
        );

        assert_eq!(head.cls_preds.dims(), [2, 45, 3]);
        assert_eq!(head.bbox_preds.dims(), [2, 45, 4]);

        // second level follows the first
        head.cls_preds
            .narrow(1, 36, 9)
            .into_data()
            .assert_approx_eq::<FT>(
                &Tensor::<B, 3>::ones([2, 9, 3], device).into_data(),
                Tolerance::default(),
            );
    }

    #[test]
    fn test_shape_errors() {
        let device = &NdArrayDevice::default();
        let anchors = grid_anchors::<B>(device);
        let gt = GroundTruth::<B>::empty(device);

        let wrong_classes = loss(3).calc_loss(
            &anchors,
            Tensor::zeros([4, 2], device),
            Tensor::zeros([4, 4], device),
            &gt,
        );
        assert!(matches!(wrong_classes, Err(RetinaError::Configuration(_))));

        let wrong_anchors = loss(3).calc_loss(
            &anchors,
            Tensor::zeros([5, 3], device),
            Tensor::zeros([5, 4], device),
            &gt,
        );
        assert!(matches!(wrong_anchors, Err(RetinaError::Configuration(_))));

        let mismatched_gt = GroundTruth::new(Tensor::<B, 2>::zeros([2, 4], device), vec![0]);
        assert!(matches!(
            mismatched_gt,
            Err(RetinaError::ContractViolation(_))
        ));

        let head = HeadOutputs {
            cls_preds: Tensor::zeros([1, 4, 3], device),
            bbox_preds: Tensor::zeros([1, 4, 4], device),
        };
        let batch_mismatch = loss(3).forward(&[anchors.clone(), anchors], head, &[gt]);
        assert!(matches!(batch_mismatch, Err(RetinaError::Configuration(_))));
    }

    #[test]
    fn test_invalid_loss_config() {
        let matcher = MatcherConfig::new();
        for config in [
            LossConfig::new(0),
            LossConfig::new(3).with_alpha(1.5),
            LossConfig::new(3).with_gamma(-1.0),
            LossConfig::new(3).with_gamma(f32::NAN),
            LossConfig::new(3).with_smooth_l1_beta(-0.1),
            LossConfig::new(3).with_smooth_l1_beta(f32::NAN),
        ] {
            assert!(matches!(
                RetinaNetLoss::from_configs(&config, &matcher),
                Err(RetinaError::Configuration(_))
            ));
        }
    }

    /// Matcher that points every anchor at a ground truth box that does not exist.
    struct OutOfRangeMatcher;

    impl Matcher for OutOfRangeMatcher {
        fn assign<BK: Backend>(
            &self,
            anchors: &Tensor<BK, 2>,
            _gt_boxes: &Tensor<BK, 2>,
        ) -> Result<Matches> {
            Ok(Matches(vec![Assignment::Foreground(5); anchors.dims()[0]]))
        }
    }

    #[test]
    fn test_matcher_contract_violation() {
        let device = &NdArrayDevice::default();
        let anchors = grid_anchors::<B>(device);
        let gt = GroundTruth::new(
            Tensor::<B, 2>::from_data([[-8.0, -8.0, 24.0, 24.0]], device),
            vec![0],
        )
        .unwrap();

        let loss =
            RetinaNetLoss::new(&LossConfig::new(3), BoxCoder::default(), OutOfRangeMatcher)
                .unwrap();
        let result = loss.calc_loss(
            &anchors,
            Tensor::zeros([4, 3], device),
            Tensor::zeros([4, 4], device),
            &gt,
        );

        assert!(matches!(result, Err(RetinaError::ContractViolation(_))));
    }

    #[test]
    fn test_gradients_flow_to_predictions() {
        type AB = Autodiff<NdArray<f32>>;
        let device = &NdArrayDevice::default();
        let anchors = grid_anchors::<AB>(device);
        let gt = GroundTruth::new(
            Tensor::<AB, 2>::from_data([[-8.0, -8.0, 24.0, 24.0]], device),
            vec![2],
        )
        .unwrap();

        let cls_pred = Tensor::<AB, 3>::zeros([1, 4, 3], device).require_grad();
        let bbox_pred = Tensor::<AB, 3>::ones([1, 4, 4], device).require_grad();
        let head = HeadOutputs {
            cls_preds: cls_pred.clone(),
            bbox_preds: bbox_pred.clone(),
        };

        let losses = loss(3).forward(&[anchors], head, &[gt]).unwrap();
        let grads = losses.total().backward();

        let cls_grad = cls_pred.grad(&grads).unwrap().into_data().to_vec::<f32>().unwrap();
        let bbox_grad = bbox_pred.grad(&grads).unwrap().into_data().to_vec::<f32>().unwrap();

        assert!(cls_grad.iter().all(|g| g.is_finite()));
        // the positive class of the matched anchor is pushed up, everything else down
        assert!(cls_grad[2] < 0.0);
        assert!(cls_grad[0] > 0.0);
        assert!(cls_grad[3..].iter().all(|g| *g > 0.0));

        // only the matched anchor's regression receives gradient
        assert!(bbox_grad[..4].iter().all(|g| *g != 0.0));
        assert!(bbox_grad[4..].iter().all(|g| *g == 0.0));

        // sigmoid(0) - t scaled by the focal weight: 0.0625 for the positive, 0.1875 otherwise
        assert_approx_eq(&cls_grad[2], &-0.03125, 1e-6);
        for (i, g) in cls_grad.iter().enumerate().filter(|(i, _)| *i != 2) {
            assert!((g - 0.09375).abs() <= 1e-6, "gradient {i} is {g}");
        }
    }

    #[test]
    fn test_focal_loss_gradient_at_zero_logits() {
        type AB = Autodiff<NdArray<f32>>;
        let device = &NdArrayDevice::default();

        let pred = Tensor::<AB, 2>::zeros([1, 2], device).require_grad();
        let target = Tensor::<AB, 2>::from_data([[1.0, 0.0]], device);

        let grads = focal_loss(pred.clone(), target, 0.25, 2.0).backward();
        let grad = pred.grad(&grads).unwrap().into_data().to_vec::<f32>().unwrap();

        assert_approx_eq(&grad[0], &-0.03125, 1e-6);
        assert_approx_eq(&grad[1], &0.09375, 1e-6);
    }

    #[test]
    fn test_degenerate_ground_truth_rejected() {
        let device = &NdArrayDevice::default();

        for b in [
            [0.0, -16.0, 0.0, 16.0],
            [-16.0, 4.0, 16.0, 2.0],
            [0.0, 0.0, f32::NAN, 8.0],
        ] {
            let gt = GroundTruth::new(Tensor::<B, 2>::from_data([b], device), vec![0]);
            assert!(
                matches!(gt, Err(RetinaError::ContractViolation(_))),
                "expected {b:?} to be rejected"
            );
        }

        assert!(
            GroundTruth::new(Tensor::<B, 2>::from_data([[0.0, 0.0, 1.0, 1.0]], device), vec![0])
                .is_ok()
        );
    }
}
