use anyhow::{Context, anyhow};
use burn::{
    config::Config,
    prelude::*,
    tensor::{TensorData, cast::ToElement},
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rust_retinanet::{
    AnchorGenerator, GroundTruth, HeadOutputs, RetinaNetLoss,
    boxes::cxcywh_to_x1y1x2y2_f32,
    config::{
        AnchorConfig, Commands, LossConfig, MatcherConfig, RetinaCmd, SubCommandAnchors,
        SubCommandLoss, grid_sizes_for_input,
    },
};
use tracing::info;

#[cfg(not(feature = "tch"))]
type CoreBackend = burn::backend::NdArray<f32>;
#[cfg(feature = "tch")]
type CoreBackend = burn::backend::LibTorch;

fn load_config<C: Config>(path: Option<&String>, default: impl FnOnce() -> C) -> anyhow::Result<C> {
    match path {
        Some(path) => C::load(path).map_err(|e| anyhow!("failed to load {path}: {e}")),
        None => Ok(default()),
    }
}

fn anchors(cmd: SubCommandAnchors) -> anyhow::Result<()> {
    let config = load_config(cmd.config.as_ref(), AnchorConfig::new)?;
    let generator = AnchorGenerator::new(&config)?;
    let grid_sizes = grid_sizes_for_input(generator.strides(), cmd.height, cmd.width);

    let device = Default::default();
    let anchors = generator.grid_anchors::<CoreBackend>(&grid_sizes, &device)?;

    for ((size, stride), count) in grid_sizes
        .iter()
        .zip(generator.strides())
        .zip(anchors.level_counts())
    {
        info!(stride, grid = ?size, count, "level");
    }
    info!(
        height = cmd.height,
        width = cmd.width,
        total = anchors.len(),
        per_location = ?generator.num_anchors(),
        "anchors"
    );

    Ok(())
}

fn loss(cmd: SubCommandLoss) -> anyhow::Result<()> {
    let anchor_config = load_config(cmd.anchor_config.as_ref(), AnchorConfig::new)?;
    let loss_config = load_config(cmd.loss_config.as_ref(), || LossConfig::new(80))?;

    let generator = AnchorGenerator::new(&anchor_config)?;
    let criterion = RetinaNetLoss::from_configs(&loss_config, &MatcherConfig::new())?;

    let device = Default::default();
    let grid_sizes = grid_sizes_for_input(generator.strides(), cmd.height, cmd.width);
    let anchors = generator.generate::<CoreBackend>(&grid_sizes, &device)?;
    let [num_anchors, _] = anchors.dims();
    let num_classes = loss_config.num_classes;

    let mut rng = StdRng::seed_from_u64(cmd.seed);
    let mut random = |len: usize| -> Vec<f32> {
        (0..len).map(|_| rng.random_range(-1.0..1.0f32)).collect()
    };

    let head = HeadOutputs::<CoreBackend> {
        cls_preds: Tensor::from_data(
            TensorData::new(
                random(cmd.batch * num_anchors * num_classes),
                [cmd.batch, num_anchors, num_classes],
            ),
            &device,
        ),
        bbox_preds: Tensor::from_data(
            TensorData::new(random(cmd.batch * num_anchors * 4), [cmd.batch, num_anchors, 4]),
            &device,
        ),
    };

    // One centered object per image, half the image in size
    let (w, h) = (cmd.width as f32, cmd.height as f32);
    let gt_box = cxcywh_to_x1y1x2y2_f32(w / 2.0, h / 2.0, w / 2.0, h / 2.0);
    let targets = (0..cmd.batch)
        .map(|i| {
            GroundTruth::new(
                Tensor::from_data(TensorData::new(gt_box.to_vec(), [1, 4]), &device),
                vec![i % num_classes],
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let losses = criterion
        .forward(&vec![anchors; cmd.batch], head, &targets)
        .context("loss computation failed")?;

    info!(
        batch = cmd.batch,
        anchors = num_anchors,
        classification = losses.classification.clone().into_scalar().to_f32(),
        regression = losses.regression.clone().into_scalar().to_f32(),
        total = losses.total().into_scalar().to_f32(),
        "losses"
    );

    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli_cmd: RetinaCmd = argh::from_env();

    match cli_cmd.commands {
        Commands::Anchors(sub_command_anchors) => anchors(sub_command_anchors),
        Commands::Loss(sub_command_loss) => loss(sub_command_loss),
    }
}
