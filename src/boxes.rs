use burn::{prelude::Backend, tensor::Tensor};

#[cfg(debug_assertions)]
use crate::check_nan;

/// Default regression weights `(wx, wy, ww, wh)`.
pub const DEFAULT_BOX_WEIGHTS: (f32, f32, f32, f32) = (10.0, 10.0, 5.0, 5.0);

/// Usual width / height delta clip for decoding head outputs, `ln(1000 / 16)`.
pub fn default_bbox_xform_clip() -> f32 {
    (1000.0f32 / 16.0).ln()
}

/// Encodes ground truth boxes as regression targets relative to anchors and decodes head
/// outputs back into boxes.
///
/// The parameterization is the one introduced with R-CNN bounding box regression:
///
/// - tx = (Gx - Ax) / Aw * wx
/// - ty = (Gy - Ay) / Ah * wy
/// - tw = log(Gw / Aw) * ww
/// - th = log(Gh / Ah) * wh
///
/// Where:
/// - (Gx, Gy, Gw, Gh) are ground truth box center coordinates, width, and height
/// - (Ax, Ay, Aw, Ah) are anchor box center coordinates, width, and height
/// - wx, wy, ww, wh are scaling weights for each regression component
///
/// Relevant excerpt from
///
/// "Rich feature hierarchies for accurate object detection and semantic segmentation"
/// Authors: Ross Girshick, Jeff Donahue, Trevor Darrell, Jitendra Malik
/// Link (official): https://arxiv.org/abs/1311.2524
///
/// Appendix Section C. Bounding-box regression
///
/// Our goal is to learn a transformation that maps a proposed box P to a ground-truth box G. We
/// parameterize the transformation in terms of four functions dx(P), dy(P), dw(P), and dh(P). The
/// first two specify a scale-invariant translation of the center of P's bounding box, while the
/// second two specify log-space translations of the width and height of P's bounding box.
///
/// The weights scale the targets to roughly unit variance, (10, 10, 5, 5) is the same as dividing
/// by the (0.1, 0.1, 0.2, 0.2) standard deviations used by most RetinaNet implementations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
    /// The weights used for the x, y, width and height components.
    pub weights: (f32, f32, f32, f32),
    /// The maximum value of the width / height deltas before `exp` while decoding, no clip
    /// when `None`.
    pub bbox_xform_clip: Option<f32>,
}

impl Default for BoxCoder {
    fn default() -> Self {
        Self::new(DEFAULT_BOX_WEIGHTS)
    }
}

impl BoxCoder {
    /// Create a new [`BoxCoder`] with the given weights. Decoding is not clipped, so it is the
    /// exact inverse of encoding.
    pub fn new(weights: (f32, f32, f32, f32)) -> Self {
        BoxCoder {
            weights,
            bbox_xform_clip: None,
        }
    }

    /// Clips the width / height deltas at `bbox_xform_clip` while decoding, for raw predictions
    /// at inference time.
    pub fn with_clip(mut self, bbox_xform_clip: f32) -> Self {
        self.bbox_xform_clip = Some(bbox_xform_clip);
        self
    }

    /// Computes the regression targets `(tx, ty, tw, th)` of `gt` relative to `anchors`.
    ///
    /// # Arguments
    ///
    /// * `gt` - Ground truth boxes tensor of shape [num_boxes, 4] in xyxy format.
    /// * `anchors` - Matched anchors tensor of shape [num_boxes, 4] in xyxy format.
    ///
    /// # Returns
    ///
    /// * `Tensor<B, 2>` - Tensor of shape [num_boxes, 4] with one target row per pair.
    pub fn encode<B: Backend>(&self, gt: Tensor<B, 2>, anchors: Tensor<B, 2>) -> Tensor<B, 2> {
        let (wx, wy, ww, wh) = self.weights;
        let (gx, gy, gw, gh) = boxes_to_components(x1y1x2y2_to_cxcywh(gt));
        let (ax, ay, aw, ah) = boxes_to_components(x1y1x2y2_to_cxcywh(anchors));

        //      Gx - Ax
        // tx = ───────
        //        Aw

        let tx = (gx - ax) / aw.clone() * wx;

        //      Gy - Ay
        // ty = ───────
        //        Ah

        let ty = (gy - ay) / ah.clone() * wy;

        //          ⎛Gw⎞
        // tw = log ⎜──⎟
        //          ⎝Aw⎠

        let tw = (gw.clone() / aw.clone()).log() * ww;
        #[cfg(debug_assertions)]
        check_nan!(tw, gw, aw);

        //          ⎛Gh⎞
        // th = log ⎜──⎟
        //          ⎝Ah⎠

        let th = (gh.clone() / ah.clone()).log() * wh;
        #[cfg(debug_assertions)]
        check_nan!(th, gh, ah);

        Tensor::cat(vec![tx, ty, tw, th], 1)
    }

    /// Applies regression deltas to anchors, the inverse of [`BoxCoder::encode`].
    ///
    /// The formulas used:
    /// - cx = dx / wx * Aw + Ax
    /// - cy = dy / wy * Ah + Ay
    /// - w = exp(dw / ww) * Aw
    /// - h = exp(dh / wh) * Ah
    ///
    /// With a `bbox_xform_clip` set, `dw` and `dh` are clamped to it before the exponent so that
    /// large predictions cannot overflow.
    ///
    /// # Returns
    ///
    /// * `Tensor<B, 2>` - Tensor of shape [num_boxes, 4] containing boxes in xyxy format.
    pub fn decode<B: Backend>(&self, deltas: Tensor<B, 2>, anchors: Tensor<B, 2>) -> Tensor<B, 2> {
        let (wx, wy, ww, wh) = self.weights;
        let (ax, ay, aw, ah) = boxes_to_components(x1y1x2y2_to_cxcywh(anchors));
        let (dx, dy, dw, dh) = boxes_to_components(deltas);

        let dx = dx / wx;
        let dy = dy / wy;
        let (dw, dh) = match self.bbox_xform_clip {
            Some(clip) => ((dw / ww).clamp_max(clip), (dh / wh).clamp_max(clip)),
            None => (dw / ww, dh / wh),
        };

        let cx = dx * aw.clone() + ax;
        let cy = dy * ah.clone() + ay;
        let w = dw.exp() * aw;
        let h = dh.exp() * ah;

        cxcywh_to_x1y1x2y2(Tensor::cat(vec![cx, cy, w, h], 1))
    }
}

/// Computes the Intersection over Union (IoU) between two sets of bounding boxes in `xyxy`
/// format.
///
/// The function returns a matrix of shape `[num_gt_boxes, num_anchors]` where each entry
/// `(i, j)` is the IoU between ground truth box `i` and anchor `j`.
///
/// # Arguments
/// * `gt_boxes` - Tensor of shape `[N, 4]` containing ground truth boxes in `xyxy` format.
/// * `anchors` - Tensor of shape `[M, 4]` containing anchors in `xyxy` format.
///
/// # Returns
/// * `Tensor<B, 2>` - IoU matrix of shape `[N, M]`.
pub fn get_iou<B: Backend>(gt_boxes: Tensor<B, 2>, anchors: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, _] = gt_boxes.dims();
    let [m, _] = anchors.dims();

    // Ground truth components become columns [N, 1], anchor components rows [1, M], both are
    // expanded to the full [N, M] pair grid
    let (gtx1, gty1, gtx2, gty2) = boxes_to_components(gt_boxes);
    let (ax1, ay1, ax2, ay2) = boxes_to_components(anchors);

    let rows = |t: Tensor<B, 2>| t.reshape([1, m]).expand([n, m]);
    let cols = |t: Tensor<B, 2>| t.expand([n, m]);

    // --- Areas ---
    let area_gt = cols((gtx2.clone() - gtx1.clone()) * (gty2.clone() - gty1.clone()));
    let area_anchor = rows((ax2.clone() - ax1.clone()) * (ay2.clone() - ay1.clone()));

    // --- Intersection corners ---
    let x1_max = cols(gtx1).max_pair(rows(ax1));
    let y1_max = cols(gty1).max_pair(rows(ay1));
    let x2_min = cols(gtx2).min_pair(rows(ax2));
    let y2_min = cols(gty2).min_pair(rows(ay2));

    // Width = x2_min - x1_max, height = y2_min - y1_max, clamp at 0 to avoid negatives
    let intersection_area = (x2_min - x1_max).clamp_min(0.0) * (y2_min - y1_max).clamp_min(0.0);

    let union = area_gt + area_anchor - intersection_area.clone();

    intersection_area / union
}

/// Splits a tensor of bounding boxes in any 4 component format (cxcywh, xyxy, ect..) into
/// individual components.
///
/// # Returns
///
/// * Tuple of four tensors `(c1, c2, c3, c4)` each of shape [num_boxes, 1].
pub fn boxes_to_components<B: Backend>(
    boxes: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
    (
        boxes.clone().narrow(1, 0, 1),
        boxes.clone().narrow(1, 1, 1),
        boxes.clone().narrow(1, 2, 1),
        boxes.narrow(1, 3, 1),
    )
}

/// Converts a tensor of bounding boxes from center format (cx, cy, w, h) to corner
/// format (x1, y1, x2, y2).
pub fn cxcywh_to_x1y1x2y2<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (cx, cy, w, h) = boxes_to_components(a);

    Tensor::cat(
        vec![
            cx.clone() - w.clone() * 0.5,
            cy.clone() - h.clone() * 0.5,
            cx + w * 0.5,
            cy + h * 0.5,
        ],
        1,
    )
}

/// Converts a tensor of bounding boxes from corner format (x1, y1, x2, y2) to center format
/// (cx, cy, w, h).
pub fn x1y1x2y2_to_cxcywh<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (x1, y1, x2, y2) = boxes_to_components(a);

    let w = x2 - x1.clone();
    let h = y2 - y1.clone();
    let cx = x1 + w.clone() * 0.5;
    let cy = y1 + h.clone() * 0.5;

    Tensor::cat(vec![cx, cy, w, h], 1)
}

/// Converts a single box from center format (cx, cy, w, h) to corner format [x1, y1, x2, y2].
pub fn cxcywh_to_x1y1x2y2_f32(cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
    [cx - w * 0.5, cy - h * 0.5, cx + w * 0.5, cy + h * 0.5]
}
