//! Camera front-ends that turn frames into filter-ready measurements.

pub mod feature_tracker;

pub use feature_tracker::{FeatureTracker, FeatureTrackerParams};
