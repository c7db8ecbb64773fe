//! Connection quality samples and scoring

use crate::peer::native::NativeStats;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

/// Derive a 1.0-5.0 quality score from network measurements
///
/// Starts at 5.0 and subtracts one penalty per metric band:
/// RTT over 300ms costs 1.5 (over 150ms costs 0.5), jitter over 50ms costs
/// 1.5 (over 30ms costs 0.5), loss over 5% costs 2.0 (over 2% costs 1.0).
pub fn quality_score(round_trip_time_ms: f64, jitter_ms: f64, packet_loss_ratio: f64) -> f64 {
    let mut score = 5.0;

    if round_trip_time_ms > 300.0 {
        score -= 1.5;
    } else if round_trip_time_ms > 150.0 {
        score -= 0.5;
    }

    if jitter_ms > 50.0 {
        score -= 1.5;
    } else if jitter_ms > 30.0 {
        score -= 0.5;
    }

    if packet_loss_ratio > 0.05 {
        score -= 2.0;
    } else if packet_loss_ratio > 0.02 {
        score -= 1.0;
    }

    f64::clamp(score, 1.0, 5.0)
}

/// Coarse label for a quality score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 4.5 {
            QualityLevel::Excellent
        } else if score >= 3.5 {
            QualityLevel::Good
        } else if score >= 2.5 {
            QualityLevel::Fair
        } else {
            QualityLevel::Poor
        }
    }
}

/// One periodic measurement of a peer connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallQualitySample {
    pub peer_id: String,
    pub round_trip_time_ms: f64,
    pub jitter_ms: f64,
    /// Fraction of packets lost since the previous sample, in [0, 1]
    pub packet_loss_ratio: f64,
    pub bitrate_bps: u64,
    pub timestamp: SystemTime,
    pub quality_score: f64,
}

impl CallQualitySample {
    pub fn new(
        peer_id: &str,
        round_trip_time_ms: f64,
        jitter_ms: f64,
        packet_loss_ratio: f64,
        bitrate_bps: u64,
    ) -> Self {
        let packet_loss_ratio = packet_loss_ratio.clamp(0.0, 1.0);
        Self {
            peer_id: peer_id.to_string(),
            round_trip_time_ms,
            jitter_ms,
            packet_loss_ratio,
            bitrate_bps,
            timestamp: SystemTime::now(),
            quality_score: quality_score(round_trip_time_ms, jitter_ms, packet_loss_ratio),
        }
    }

    /// Build a sample from two consecutive stats reports
    ///
    /// Loss and bitrate are computed over the interval between `previous`
    /// and `current`; the first report of a connection is measured against
    /// zero counters.
    pub fn from_stats(
        peer_id: &str,
        previous: Option<&NativeStats>,
        current: &NativeStats,
        elapsed: Duration,
        jitter_ms: f64,
    ) -> Self {
        let baseline = previous.cloned().unwrap_or_default();

        let received = current.packets_received.saturating_sub(baseline.packets_received);
        let lost = current.packets_lost.saturating_sub(baseline.packets_lost);
        let loss = if received + lost == 0 {
            0.0
        } else {
            lost as f64 / (received + lost) as f64
        };

        let bytes = (current.bytes_sent + current.bytes_received)
            .saturating_sub(baseline.bytes_sent + baseline.bytes_received);
        let secs = elapsed.as_secs_f64();
        let bitrate = if secs > 0.0 {
            (bytes as f64 * 8.0 / secs) as u64
        } else {
            0
        };

        Self::new(
            peer_id,
            current.round_trip_time_ms.unwrap_or(0.0),
            current.jitter_ms.unwrap_or(jitter_ms),
            loss,
            bitrate,
        )
    }

    pub fn level(&self) -> QualityLevel {
        QualityLevel::from_score(self.quality_score)
    }

    /// Worth showing a network warning to the user
    pub fn is_degraded(&self) -> bool {
        self.quality_score < 3.0
    }
}

/// Interarrival jitter estimate from successive RTT readings
///
/// Uses the RFC 3550 running average `J += (|D| - J) / 16` where `D` is the
/// change between consecutive readings.
#[derive(Debug, Clone, Default)]
pub struct JitterEstimator {
    last_rtt_ms: Option<f64>,
    jitter_ms: f64,
}

impl JitterEstimator {
    pub fn update(&mut self, rtt_ms: f64) -> f64 {
        if let Some(last) = self.last_rtt_ms {
            let delta = (rtt_ms - last).abs();
            self.jitter_ms += (delta - self.jitter_ms) / 16.0;
        }
        self.last_rtt_ms = Some(rtt_ms);
        self.jitter_ms
    }

    pub fn current(&self) -> f64 {
        self.jitter_ms
    }
}

/// Bounded rolling history of samples for one peer, oldest evicted first
#[derive(Debug, Clone)]
pub struct QualityHistory {
    samples: VecDeque<CallQualitySample>,
    capacity: usize,
}

impl QualityHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: CallQualitySample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&CallQualitySample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mean score over the retained window
    pub fn average_score(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|s| s.quality_score).sum();
        Some(total / self.samples.len() as f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallQualitySample> {
        self.samples.iter()
    }
}
