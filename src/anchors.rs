use burn::{
    prelude::Backend,
    tensor::{Device, Tensor, TensorData},
};
use tracing::debug;

use crate::config::AnchorConfig;
use crate::error::{Result, RetinaError};

/// Canonical anchor boxes of one pyramid level, xyxy and centered on the origin.
pub type CellAnchors = Vec<[f32; 4]>;

/// If a single size (or aspect ratio) list is specified and there are multiple feature maps, the
/// anchors of that list are broadcast over all feature maps. A list per feature map is used as
/// is, anything else is a configuration error.
fn broadcast_params(params: &[Vec<f32>], num_levels: usize, name: &str) -> Result<Vec<Vec<f32>>> {
    if params.is_empty() {
        return Err(RetinaError::config(format!(
            "{name} in anchor generator cannot be empty"
        )));
    }

    for level in params.iter() {
        if level.is_empty() {
            return Err(RetinaError::config(format!(
                "{name} in anchor generator contains an empty level"
            )));
        }
        if let Some(bad) = level.iter().find(|v| !v.is_finite() || **v <= 0.0) {
            return Err(RetinaError::config(format!(
                "{name} in anchor generator must be strictly positive, got {bad}"
            )));
        }
    }

    match params.len() {
        1 => Ok(vec![params[0].clone(); num_levels]),
        n if n == num_levels => Ok(params.to_vec()),
        n => Err(RetinaError::config(format!(
            "got {name} of length {n} in anchor generator, but the number of levels is {num_levels}"
        ))),
    }
}

/// Generates anchors for a feature pyramid.
///
/// The canonical anchors of every level are computed once at construction. For a given set of
/// feature map sizes they are then shifted to the center of every grid cell:
///
/// - levels are enumerated in ascending order,
/// - within a level grid positions are enumerated row-major (y outer, x inner),
/// - for every grid position all of the level's cell anchors appear contiguously.
///
/// Detection head outputs have to be flattened in exactly this order.
///
/// Relevant excerpt from
///
/// "Focal Loss for Dense Object Detection"
/// Authors: Tsung-Yi Lin, Priya Goyal, Ross Girshick, Kaiming He, Piotr Dollár
/// Link (official): https://arxiv.org/abs/1708.02002
///
/// Lin et al. - Pg 4, Anchors
///
/// We use translation-invariant anchor boxes similar to those in the RPN variant in [20]. The
/// anchors have areas of 32² to 512² on pyramid levels P3 to P7, respectively.
///
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    strides: Vec<usize>,
    offset: f32,
    cell_anchors: Vec<CellAnchors>,
}

impl AnchorGenerator {
    /// Validates `config` and builds the cell anchors of every level.
    ///
    /// # Errors
    ///
    /// [`RetinaError::Configuration`] for empty or zero strides, empty or non positive sizes and
    /// aspect ratios, lists that can not be broadcast to the number of levels and offsets
    /// outside of `[0, 1)`.
    pub fn new(config: &AnchorConfig) -> Result<Self> {
        let num_levels = config.strides.len();

        if num_levels == 0 {
            return Err(RetinaError::config("strides in anchor generator cannot be empty"));
        }
        if config.strides.contains(&0) {
            return Err(RetinaError::config("anchor strides must be non zero"));
        }
        if !(0.0..1.0).contains(&config.offset) {
            return Err(RetinaError::config(format!(
                "anchor offset has to be in [0, 1), got {}",
                config.offset
            )));
        }

        let sizes = broadcast_params(&config.sizes, num_levels, "sizes")?;
        let aspect_ratios = broadcast_params(&config.aspect_ratios, num_levels, "aspect_ratios")?;

        let cell_anchors: Vec<CellAnchors> = sizes
            .iter()
            .zip(aspect_ratios.iter())
            .map(|(s, a)| generate_cell_anchors(s, a))
            .collect();

        debug!(
            levels = num_levels,
            anchors_per_cell = ?cell_anchors.iter().map(|c| c.len()).collect::<Vec<_>>(),
            "built cell anchors"
        );

        Ok(AnchorGenerator {
            strides: config.strides.clone(),
            offset: config.offset,
            cell_anchors,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.strides.len()
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> f32 {
        self.offset
    }

    /// Canonical anchors of `level`, `None` past the last level.
    pub fn cell_anchors(&self, level: usize) -> Option<&CellAnchors> {
        self.cell_anchors.get(level)
    }

    /// Number of anchors at every grid location of each level, e.g. 9 for 3 sizes and 3 aspect
    /// ratios.
    pub fn num_anchors(&self) -> Vec<usize> {
        self.cell_anchors.iter().map(|c| c.len()).collect()
    }

    /// Total number of anchors for the given `[height, width]` feature map sizes.
    pub fn total_anchors(&self, grid_sizes: &[[usize; 2]]) -> usize {
        grid_sizes
            .iter()
            .zip(self.num_anchors())
            .map(|([h, w], a)| h * w * a)
            .sum()
    }

    /// Tiles the cell anchors over every grid cell of every level, one tensor of shape
    /// `[H * W * A, 4]` per level.
    ///
    /// # Errors
    ///
    /// [`RetinaError::Configuration`] when the number of grid sizes does not match the number of
    /// levels.
    pub fn grid_anchors<B: Backend>(
        &self,
        grid_sizes: &[[usize; 2]],
        device: &Device<B>,
    ) -> Result<AnchorSet<B>> {
        if grid_sizes.len() != self.num_levels() {
            return Err(RetinaError::config(format!(
                "got {} feature map sizes, but the anchor generator has {} levels",
                grid_sizes.len(),
                self.num_levels()
            )));
        }

        let mut levels = Vec::with_capacity(grid_sizes.len());

        for ((size, stride), cell_anchors) in grid_sizes
            .iter()
            .zip(self.strides.iter())
            .zip(self.cell_anchors.iter())
        {
            let (shifts_x, shifts_y) = grid_offsets(*size, *stride, self.offset);

            // e.g. a 64x64 P3 map with 9 cell anchors is 36864 boxes
            let count = shifts_x.len() * shifts_y.len() * cell_anchors.len();
            let mut boxes: Vec<f32> = Vec::with_capacity(count * 4);

            for sy in &shifts_y {
                for sx in &shifts_x {
                    for [x0, y0, x1, y1] in cell_anchors {
                        boxes.extend([x0 + sx, y0 + sy, x1 + sx, y1 + sy]);
                    }
                }
            }

            debug!(?size, stride, count, "tiled level anchors");

            levels.push(Tensor::<B, 2>::from_data(
                TensorData::new(boxes, [count, 4]),
                device,
            ));
        }

        Ok(AnchorSet { levels })
    }

    /// Anchors of all levels for one image, concatenated in level order.
    pub fn generate<B: Backend>(
        &self,
        grid_sizes: &[[usize; 2]],
        device: &Device<B>,
    ) -> Result<Tensor<B, 2>> {
        Ok(self.grid_anchors(grid_sizes, device)?.concat())
    }

    /// Generates the anchors of every image of a batch.
    ///
    /// Only the spatial size `[.., H, W]` of each feature map is read. The anchors only depend on
    /// the grid sizes, so they are computed once and shared by all `num_images` images.
    ///
    /// # Returns
    ///
    /// `num_images` tensors of shape `[total_anchors, 4]`.
    pub fn forward<B: Backend>(
        &self,
        num_images: usize,
        feature_maps: &[Tensor<B, 4>],
    ) -> Result<Vec<Tensor<B, 2>>> {
        let Some(first) = feature_maps.first() else {
            return Err(RetinaError::config("no feature maps to generate anchors for"));
        };
        let device = first.device();

        let grid_sizes: Vec<[usize; 2]> = feature_maps
            .iter()
            .map(|f| {
                let [_, _, h, w] = f.dims();
                [h, w]
            })
            .collect();

        let anchors = self.generate::<B>(&grid_sizes, &device)?;

        Ok(vec![anchors; num_images])
    }
}

/// Generates the canonical anchors of one level, all anchor boxes of the different sizes and
/// aspect ratios centered at (0, 0). Sizes are the outer loop and aspect ratios the inner one.
///
/// # Arguments
///
/// * `sizes` - Square roots of the anchor areas.
/// * `aspect_ratios` - Anchor height / width.
///
/// # Returns
///
/// `sizes.len() * aspect_ratios.len()` boxes in xyxy format.
pub fn generate_cell_anchors(sizes: &[f32], aspect_ratios: &[f32]) -> CellAnchors {
    let mut anchors = Vec::with_capacity(sizes.len() * aspect_ratios.len());

    for size in sizes {
        let area = size * size;
        for aspect_ratio in aspect_ratios {
            let w = (area / aspect_ratio).sqrt();
            let h = aspect_ratio * w;
            anchors.push([-w / 2.0, -h / 2.0, w / 2.0, h / 2.0]);
        }
    }

    anchors
}

/// Centers of the grid cells of a `[height, width]` feature map in image pixels. The first
/// center sits at `offset * stride`, the following ones `stride` apart.
pub fn grid_offsets(size: [usize; 2], stride: usize, offset: f32) -> (Vec<f32>, Vec<f32>) {
    let [h, w] = size;
    let stride = stride as f32;
    let start = offset * stride;

    (
        (0..w).map(|i| start + i as f32 * stride).collect(),
        (0..h).map(|j| start + j as f32 * stride).collect(),
    )
}

/// The anchors of one image, one `[H * W * A, 4]` tensor per pyramid level.
#[derive(Debug, Clone)]
pub struct AnchorSet<B: Backend> {
    levels: Vec<Tensor<B, 2>>,
}

impl<B: Backend> AnchorSet<B> {
    pub fn levels(&self) -> &[Tensor<B, 2>] {
        &self.levels
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Number of anchors on each level.
    pub fn level_counts(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.dims()[0]).collect()
    }

    pub fn len(&self) -> usize {
        self.level_counts().iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All levels concatenated into a single `[total_anchors, 4]` tensor.
    pub fn concat(self) -> Tensor<B, 2> {
        Tensor::cat(self.levels, 0)
    }
}
