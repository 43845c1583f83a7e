//! Turning raw model outputs into [`DetectionBox`]es.

use std::cmp::Ordering;

use super::{DetectionBox, Detections, LabelMap};

/// Upper bound on boxes kept after NMS, as in the usual grid-detector export.
pub const MAX_DETECTIONS: usize = 300;

/// Region-proposal vocabulary; index 0 is background.
pub const REGION_PROPOSAL_LABELS: [&str; 3] = ["__background__", "dent_marginal", "dent_unacceptable"];

/// A scored box before label mapping. `bbox` is `[x1, y1, x2, y2]` in pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub bbox: [f32; 4],
    pub class: i32,
    pub score: f32,
}

/// Read the four detection-postprocess tensors (boxes as normalized
/// `[ymin, xmin, ymax, xmax]`, classes, scores, count) into pixel candidates.
pub fn candidates_from_proposals(
    locations: &[f32],
    classes: &[f32],
    scores: &[f32],
    count: usize,
    width: f32,
    height: f32,
) -> Vec<Candidate> {
    let count = count
        .min(classes.len())
        .min(scores.len())
        .min(locations.len() / 4);
    (0..count)
        .map(|index| {
            let ymin = (height * locations[4 * index]).clamp(0.0, height);
            let xmin = (width * locations[4 * index + 1]).clamp(0.0, width);
            let ymax = (height * locations[4 * index + 2]).clamp(0.0, height);
            let xmax = (width * locations[4 * index + 3]).clamp(0.0, width);
            Candidate {
                bbox: [xmin, ymin, xmax, ymax],
                class: classes[index] as i32,
                score: scores[index],
            }
        })
        .collect()
}

/// Keep proposals at or above `threshold` whose class maps to a real label.
///
/// `class_offset` shifts raw class ids into the vocabulary; index 0 of the
/// vocabulary is the background class and is never reported.
pub fn filter_proposals(
    candidates: Vec<Candidate>,
    threshold: f32,
    vocabulary: &[&str],
    class_offset: i32,
) -> Detections {
    candidates
        .into_iter()
        .filter(|candidate| candidate.score >= threshold)
        .filter_map(|candidate| {
            let index = candidate.class + class_offset;
            if index <= 0 {
                return None;
            }
            let label = vocabulary.get(index as usize)?;
            tracing::trace!(
                "proposal {label} with score {} at {:?}",
                candidate.score,
                candidate.bbox
            );
            Some(to_box(&candidate, label))
        })
        .collect()
}

/// Grid output that does not line up with the model or its labels.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error("expected a [1, 4 + classes, anchors] output, got {0:?}")]
    Layout(Vec<usize>),
    #[error("output of {len} values is not a whole number of {channels}-channel anchors")]
    Length { len: usize, channels: usize },
    #[error("label file has no entry for class {0}")]
    MissingLabel(usize),
}

/// Class count of a `[1, 4 + classes, anchors]` grid output. Every class
/// must have a label.
pub fn grid_classes(dims: &[usize], labels: &LabelMap) -> Result<usize, GridError> {
    let num_classes = match dims {
        [1, channels, anchors] if *channels > 4 && *anchors > 0 => channels - 4,
        _ => return Err(GridError::Layout(dims.to_vec())),
    };
    if let Some(class) = (0..num_classes).find(|&class| labels.lookup(class as i32).is_none()) {
        return Err(GridError::MissingLabel(class));
    }
    Ok(num_classes)
}

/// Decode a grid detector output laid out as `[4 + classes, anchors]`
/// (channel-major), rows being `cx, cy, w, h, score_0 .. score_n`.
///
/// Each anchor keeps its best class; anchors under `threshold` are dropped.
/// Coordinates are multiplied by `scale` and clamped to `[0, scale]`.
pub fn decode_grid(
    output: &[f32],
    num_classes: usize,
    threshold: f32,
    scale: f32,
) -> Result<Vec<Candidate>, GridError> {
    let channels = 4 + num_classes;
    if num_classes == 0 || output.len() % channels != 0 {
        return Err(GridError::Length {
            len: output.len(),
            channels,
        });
    }
    let anchors = output.len() / channels;
    let at = |channel: usize, anchor: usize| output[channel * anchors + anchor];

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let (class, score) = (0..num_classes)
            .map(|class| (class, at(4 + class, anchor)))
            .fold((0, f32::MIN), |best, next| if next.1 > best.1 { next } else { best });
        if score < threshold {
            continue;
        }
        let (cx, cy) = (at(0, anchor) * scale, at(1, anchor) * scale);
        let (w, h) = (at(2, anchor) * scale, at(3, anchor) * scale);
        let bbox = [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
            .map(|edge| edge.clamp(0.0, scale));
        candidates.push(Candidate {
            bbox,
            class: class as i32,
            score,
        });
    }
    Ok(candidates)
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);
    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Class-aware non-maximum suppression. Output is sorted by score, highest
/// first, and holds at most [`MAX_DETECTIONS`] boxes.
pub fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if keep.len() >= MAX_DETECTIONS {
            break;
        }
        let overlaps = keep.iter().any(|kept| {
            kept.class == candidate.class && iou(&kept.bbox, &candidate.bbox) > iou_threshold
        });
        if !overlaps {
            keep.push(candidate);
        }
    }
    keep
}

/// Attach labels from the backend's own label list.
pub fn label_candidates(candidates: Vec<Candidate>, labels: &LabelMap) -> Detections {
    candidates
        .iter()
        .map(|candidate| to_box(candidate, labels.lookup(candidate.class).unwrap_or("?")))
        .collect()
}

fn to_box(candidate: &Candidate, label: &str) -> DetectionBox {
    let [x1, y1, x2, y2] = candidate.bbox;
    DetectionBox {
        x1,
        y1,
        x2,
        y2,
        label: label.to_string(),
        score: candidate.score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(bbox: [f32; 4], class: i32, score: f32) -> Candidate {
        Candidate { bbox, class, score }
    }

    #[test]
    fn test_candidates_from_proposals() {
        let locations = [0.125, 0.25, 0.5, 0.75, 0.0, 0.0, 1.5, 1.0];
        let classes = [1.0, 2.0];
        let scores = [0.9, 0.4];
        let out = candidates_from_proposals(&locations, &classes, &scores, 2, 100.0, 200.0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].bbox, [25.0, 25.0, 75.0, 100.0]);
        assert_eq!(out[0].class, 1);
        // clamped to the frame
        assert_eq!(out[1].bbox, [0.0, 0.0, 100.0, 200.0]);
    }

    #[test]
    fn test_count_is_bounded_by_tensor_sizes() {
        let out = candidates_from_proposals(&[0.0; 4], &[1.0], &[0.9], 10, 1.0, 1.0);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_filter_proposals_threshold_and_background() {
        let proposals = vec![
            candidate([0.0, 0.0, 1.0, 1.0], 1, 0.5),
            candidate([0.0, 0.0, 1.0, 1.0], 2, 0.49),
            candidate([0.0, 0.0, 1.0, 1.0], 0, 0.99),
            candidate([0.0, 0.0, 1.0, 1.0], 7, 0.99),
            candidate([1.0, 1.0, 2.0, 2.0], 2, 0.8),
        ];
        let boxes = filter_proposals(proposals, 0.5, &REGION_PROPOSAL_LABELS, 0);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].label, "dent_marginal");
        assert_eq!(boxes[0].score, 0.5);
        assert_eq!(boxes[1].label, "dent_unacceptable");
        assert!(boxes.iter().all(|b| b.score >= 0.5 && b.label != "__background__"));
    }

    #[test]
    fn test_filter_proposals_offset() {
        let proposals = vec![candidate([0.0, 0.0, 1.0, 1.0], 0, 0.9)];
        let boxes = filter_proposals(proposals, 0.5, &REGION_PROPOSAL_LABELS, 1);
        assert_eq!(boxes[0].label, "dent_marginal");
    }

    #[test]
    fn test_decode_grid() {
        // two classes, three anchors, channel-major
        #[rustfmt::skip]
        let output = [
            0.5, 0.1, 0.2, // cx
            0.5, 0.1, 0.2, // cy
            0.2, 0.1, 0.1, // w
            0.4, 0.1, 0.1, // h
            0.1, 0.9, 0.0, // class 0
            0.7, 0.2, 0.1, // class 1
        ];
        let out = decode_grid(&output, 2, 0.25, 10.0).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].class, 1);
        assert!((out[0].score - 0.7).abs() < 1e-6);
        let expected = [4.0, 3.0, 6.0, 7.0];
        for (got, want) in out[0].bbox.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5);
        }
        assert_eq!(out[1].class, 0);
    }

    #[test]
    fn test_decode_grid_clamps_to_frame() {
        // one class, one anchor hanging over the right edge
        let out = decode_grid(&[0.99, 0.5, 0.2, 0.2, 0.9], 1, 0.25, 512.0).unwrap();
        assert_eq!(out.len(), 1);
        let [x1, y1, x2, y2] = out[0].bbox;
        assert!((x1 - 455.68).abs() < 1e-3);
        assert!((y1 - 204.8).abs() < 1e-3);
        assert_eq!(x2, 512.0);
        assert!((y2 - 307.2).abs() < 1e-3);

        let out = decode_grid(&[0.0, 0.0, 0.5, 0.5, 0.9], 1, 0.25, 100.0).unwrap();
        assert_eq!(out[0].bbox, [0.0, 0.0, 25.0, 25.0]);
    }

    #[test]
    fn test_decode_grid_rejects_misaligned_output() {
        // three classes and two anchors read as two classes
        let output = [0.5; 14];
        assert_eq!(
            decode_grid(&output, 2, 0.25, 512.0),
            Err(GridError::Length { len: 14, channels: 6 })
        );
        assert!(decode_grid(&output, 3, 0.25, 512.0).is_ok());
        assert!(decode_grid(&output, 0, 0.25, 512.0).is_err());
    }

    #[test]
    fn test_grid_classes_come_from_the_output_shape() {
        let labels = LabelMap::parse("0 a\n1 b\n2 c\n").unwrap();
        assert_eq!(grid_classes(&[1, 7, 8400], &labels), Ok(3));

        // sparse label file: len() is 2 but class 1 is missing
        let sparse = LabelMap::parse("0 a\n2 c\n").unwrap();
        assert_eq!(sparse.len(), 2);
        assert_eq!(grid_classes(&[1, 7, 2], &sparse), Err(GridError::MissingLabel(1)));

        // transposed export
        assert_eq!(
            grid_classes(&[1, 8400, 7], &labels),
            Err(GridError::MissingLabel(3))
        );
        assert_eq!(grid_classes(&[7, 8400], &labels), Err(GridError::Layout(vec![7, 8400])));
        assert_eq!(grid_classes(&[1, 4, 10], &labels), Err(GridError::Layout(vec![1, 4, 10])));
    }

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert_eq!(iou(&a, &a), 1.0);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        let half = iou(&a, &[5.0, 0.0, 15.0, 10.0]);
        assert!((half - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_is_class_aware() {
        let out = nms(
            vec![
                candidate([0.0, 0.0, 10.0, 10.0], 0, 0.6),
                candidate([1.0, 1.0, 10.0, 10.0], 0, 0.9),
                candidate([1.0, 1.0, 10.0, 10.0], 1, 0.5),
                candidate([50.0, 50.0, 60.0, 60.0], 0, 0.3),
            ],
            0.45,
        );
        let scores: Vec<f32> = out.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.5, 0.3]);
    }

    #[test]
    fn test_label_candidates() {
        let labels: LabelMap = ["dent", "scratch"].into_iter().collect();
        let boxes = label_candidates(
            vec![
                candidate([0.0, 0.0, 1.0, 1.0], 1, 0.8),
                candidate([0.0, 0.0, 1.0, 1.0], 5, 0.7),
            ],
            &labels,
        );
        assert_eq!(boxes[0].label, "scratch");
        assert_eq!(boxes[1].label, "?");
    }
}
