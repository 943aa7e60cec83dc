//! Feature-track front-end.
//!
//! Consumes per-frame detected keypoints and maintains running tracks by
//! feature id. A track terminates when its feature misses a frame or when
//! it reaches the maximum length; terminated tracks of sufficient length
//! are handed to the MSCKF updater in one batch.

use std::collections::BTreeMap;

use tracing::debug;

use crate::ekf::state::FrameId;
use crate::ekf::update::msckf::{FeaturePoint, FeatureTrack};
use crate::msg::DetectedFeature;

#[derive(Debug, Clone)]
pub struct FeatureTrackerParams {
    pub min_track_length: usize,
    pub max_track_length: usize,
    /// Minimum pixel distance to existing features before a detection may
    /// start a new track.
    pub min_feat_dist: f64,
    /// Grid downsampling shape; `None` keeps every detection.
    pub grid: Option<(usize, usize)>,
    /// Image extent used to size the downsampling grid.
    pub image_width: f64,
    pub image_height: f64,
}

impl Default for FeatureTrackerParams {
    fn default() -> Self {
        Self {
            min_track_length: 2,
            max_track_length: 20,
            min_feat_dist: 1.0,
            grid: None,
            image_width: 640.0,
            image_height: 480.0,
        }
    }
}

pub struct FeatureTracker {
    params: FeatureTrackerParams,
    tracks: BTreeMap<u32, Vec<FeaturePoint>>,
}

impl FeatureTracker {
    pub fn new(params: FeatureTrackerParams) -> Self {
        Self {
            params,
            tracks: BTreeMap::new(),
        }
    }

    pub fn max_track_length(&self) -> usize {
        self.params.max_track_length
    }

    /// Bins detections into a rows×cols grid and keeps the strongest
    /// response per bin.
    fn grid_downsample(&self, features: Vec<DetectedFeature>) -> Vec<DetectedFeature> {
        let Some((rows, cols)) = self.params.grid else {
            return features;
        };
        let bin_w = self.params.image_width / cols as f64;
        let bin_h = self.params.image_height / rows as f64;

        let mut best: BTreeMap<(usize, usize), DetectedFeature> = BTreeMap::new();
        for feature in features {
            let col = ((feature.pixel.x / bin_w) as usize).min(cols - 1);
            let row = ((feature.pixel.y / bin_h) as usize).min(rows - 1);
            match best.get(&(row, col)) {
                Some(kept) if kept.response >= feature.response => {}
                _ => {
                    best.insert((row, col), feature);
                }
            }
        }
        best.into_values().collect()
    }

    fn near_existing_feature(&self, feature: &DetectedFeature) -> bool {
        self.tracks.values().any(|points| {
            points
                .last()
                .map(|p| (p.pixel - feature.pixel).norm() < self.params.min_feat_dist)
                .unwrap_or(false)
        })
    }

    /// Ingests one frame and returns the tracks terminated by it.
    pub fn track(&mut self, frame_id: FrameId, features: Vec<DetectedFeature>) -> Vec<FeatureTrack> {
        let features = self.grid_downsample(features);

        for feature in features {
            if let Some(points) = self.tracks.get_mut(&feature.feature_id) {
                points.push(FeaturePoint {
                    frame_id,
                    pixel: feature.pixel,
                });
            } else if !self.near_existing_feature(&feature) {
                self.tracks.insert(
                    feature.feature_id,
                    vec![FeaturePoint {
                        frame_id,
                        pixel: feature.pixel,
                    }],
                );
            }
        }

        // Terminate: not matched in this frame, or at maximum length.
        let mut terminated = Vec::new();
        let mut finished_ids = Vec::new();
        for (feature_id, points) in &self.tracks {
            let missed = points.last().map(|p| p.frame_id < frame_id).unwrap_or(true);
            let full = points.len() >= self.params.max_track_length;
            if missed || full {
                finished_ids.push(*feature_id);
                if points.len() >= self.params.min_track_length {
                    terminated.push(FeatureTrack {
                        feature_id: *feature_id,
                        points: points.clone(),
                    });
                }
            }
        }
        for feature_id in finished_ids {
            self.tracks.remove(&feature_id);
        }

        if !terminated.is_empty() {
            debug!(frame_id, count = terminated.len(), "terminated feature tracks");
        }
        terminated
    }
}
