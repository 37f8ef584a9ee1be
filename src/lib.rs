#![recursion_limit = "256"]

pub mod anchors;
pub mod boxes;
pub mod config;
pub mod debug;
pub mod error;
pub mod levels;
pub mod loss;
pub mod matcher;

pub use anchors::{AnchorGenerator, AnchorSet};
pub use boxes::BoxCoder;
pub use error::{Result, RetinaError};
pub use loss::{DetectionLosses, GroundTruth, HeadOutputs, RetinaNetLoss};
pub use matcher::{Assignment, IouMatcher, Matcher, Matches};
