/// Feature pyramid levels used by the RetinaNet detection heads.
///
/// Each variant is one resolution stage of the feature pyramid network, from the highest
/// resolution level (`P3`, stride 8) down to the coarsest (`P7`, stride 128). The levels are
/// listed in the order anchors and head outputs are concatenated.
///
/// Relevant excerpt from
///
/// "Focal Loss for Dense Object Detection"
/// Authors: Tsung-Yi Lin, Priya Goyal, Ross Girshick, Kaiming He, Piotr Dollár
/// Link (official): https://arxiv.org/abs/1708.02002
///
/// Lin et al. - Pg 4
///
/// The anchors have areas of 32² to 512² on pyramid levels P3 to P7, respectively. As in [20],
/// at each pyramid level we use anchors at three aspect ratios {1:2, 1:1, 2:1}. For denser scale
/// coverage than in [20], at each level we add anchors of sizes {2^0, 2^(1/3), 2^(2/3)} of the
/// original set of 3 aspect ratio anchors. This improve AP in our setting. In total there are
/// A = 9 anchors per level.
///
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyramidLevel {
    /// `P3` — stride 8, anchors of base size 32.
    P3 = 3,
    /// `P4` — stride 16, anchors of base size 64.
    P4,
    /// `P5` — stride 32, anchors of base size 128.
    P5,
    /// `P6` — stride 64, anchors of base size 256.
    P6,
    /// `P7` — stride 128, anchors of base size 512.
    P7,
}

/// Octave scales added on top of the base size of every level.
pub const OCTAVE_SCALES: [f32; 3] = [1.0, 1.259_921, 1.587_401];

/// Aspect ratios (height / width) used on every level.
pub const ASPECT_RATIOS: [f32; 3] = [0.5, 1.0, 2.0];

impl PyramidLevel {
    /// Returns all pyramid levels in the order anchors are enumerated.
    pub fn as_list() -> Vec<PyramidLevel> {
        vec![
            PyramidLevel::P3,
            PyramidLevel::P4,
            PyramidLevel::P5,
            PyramidLevel::P6,
            PyramidLevel::P7,
        ]
    }

    pub fn count() -> usize {
        Self::as_list().len()
    }

    /// Pyramid index `l` of the level, the `l` in `P_l`.
    pub fn get_id(&self) -> usize {
        *self as usize
    }

    /// Pixels per grid cell, `2^l`.
    pub fn stride(&self) -> usize {
        1 << self.get_id()
    }

    /// Square root of the area of the smallest anchor on this level, `4 * stride`.
    pub fn base_size(&self) -> f32 {
        (4 * self.stride()) as f32
    }

    /// Anchor sizes for this level, the base size scaled by every octave scale.
    pub fn sizes(&self) -> Vec<f32> {
        OCTAVE_SCALES
            .iter()
            .map(|scale| self.base_size() * scale)
            .collect()
    }

    pub fn default_strides() -> Vec<usize> {
        Self::as_list().iter().map(|l| l.stride()).collect()
    }

    pub fn default_sizes() -> Vec<Vec<f32>> {
        Self::as_list().iter().map(|l| l.sizes()).collect()
    }

    /// A single ratio list, broadcast over every level.
    pub fn default_aspect_ratios() -> Vec<Vec<f32>> {
        vec![ASPECT_RATIOS.to_vec()]
    }
}
