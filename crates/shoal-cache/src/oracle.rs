//! Sequence-pattern detector feeding block read-ahead.
//!
//! Keeps a short sliding history of block numbers per owner and predicts
//! the continuation of the dominant stride. Differences are sampled over
//! immediate and one-past-immediate neighbors so a single outlier does
//! not break the pattern; backward strides work the same as forward ones.

use std::collections::VecDeque;

/// Whether previously issued predictions are filtered out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    /// Subtract block numbers already predicted for this owner; the
    /// streaming case.
    Continue,
    /// Return the full prediction regardless of history.
    All,
}

/// Per-owner stride detector.
#[derive(Debug)]
pub struct PrefetchOracle {
    max_prediction: usize,
    capacity: usize,
    sequence: VecDeque<i64>,
    past_prediction: VecDeque<i64>,
}

impl PrefetchOracle {
    pub fn new(max_prediction: usize) -> Self {
        let capacity = if max_prediction > 8 {
            max_prediction + 2
        } else {
            10
        };
        Self {
            max_prediction,
            capacity,
            sequence: VecDeque::new(),
            past_prediction: VecDeque::new(),
        }
    }

    /// Records an access. Numbers already in the window are ignored so
    /// re-reads do not dilute the stride.
    pub fn add(&mut self, number: i64) {
        if self.sequence.contains(&number) {
            return;
        }
        self.sequence.push_front(number);
        if self.sequence.len() > self.capacity {
            self.sequence.pop_back();
        }
    }

    /// Predicts up to `length` future block numbers.
    pub fn predict(&mut self, length: usize, prediction_type: PredictionType) -> Vec<i64> {
        let length = length.min(self.max_prediction);

        if self.sequence.len() < 3 {
            return Vec::new();
        }

        // Accumulate originating elements under each observed difference.
        // Insertion order is kept so frequency ties resolve to the first
        // difference encountered.
        let mut distances: Vec<(i64, Vec<i64>)> = Vec::new();
        let seq: Vec<i64> = self.sequence.iter().copied().collect();
        for i in 0..seq.len() {
            if i + 1 < seq.len() {
                accumulate(&mut distances, seq[i] - seq[i + 1], seq[i]);
            }
            if i + 2 < seq.len() {
                accumulate(&mut distances, seq[i] - seq[i + 2], seq[i]);
            }
        }

        // Strict comparison keeps the first-encountered difference on a
        // frequency tie.
        let mut best = 0;
        for (i, (_, origins)) in distances.iter().enumerate() {
            if origins.len() > distances[best].1.len() {
                best = i;
            }
        }
        let (difference, origins) = (distances[best].0, distances[best].1.clone());

        // Only predict once the dominant stride explains most of the
        // history.
        let confidence_floor = (self.sequence.len() as f64 * 0.75) as usize;
        if origins.len() < confidence_floor {
            return Vec::new();
        }

        let anchor = origins[0];
        let mut prediction = Vec::new();
        for i in 1..=origins.len() {
            let p = anchor + i as i64 * difference;
            if p > 0 && prediction.len() < length {
                prediction.push(p);
            }
        }

        if prediction_type == PredictionType::Continue {
            prediction.retain(|p| !self.past_prediction.contains(p));
        }

        for p in &prediction {
            self.past_prediction.push_front(*p);
        }
        self.past_prediction.truncate(self.capacity);

        prediction
    }
}

fn accumulate(distances: &mut Vec<(i64, Vec<i64>)>, difference: i64, origin: i64) {
    match distances.iter_mut().find(|(d, _)| *d == difference) {
        Some((_, origins)) => origins.push(origin),
        None => distances.push((difference, vec![origin])),
    }
}
