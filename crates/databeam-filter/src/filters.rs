//! Filter arithmetic over per-channel sample rings.
//!
//! The window is either a sample count or a time span in seconds
//! (`timebase_value`). Rings are pruned on every insert, so `compute` only
//! ever sees the configured window.

use std::collections::{HashMap, VecDeque};

const RING_RESERVE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMethod {
    Average,
    ExponentialAverage,
    Median,
    DownsampleAverage,
}

impl FilterMethod {
    pub const NAMES: [&'static str; 4] = [
        "average",
        "exponential_average",
        "median",
        "downsample_average",
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "average" => Some(Self::Average),
            "exponential_average" => Some(Self::ExponentialAverage),
            "median" => Some(Self::Median),
            "downsample_average" => Some(Self::DownsampleAverage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timebase {
    Samples,
    Time,
}

#[derive(Debug, Clone, Copy)]
struct FilterSample {
    ts_ns: u64,
    value: f64,
}

pub struct Filter {
    method: FilterMethod,
    timebase: Timebase,
    timebase_value: f64,
    channels: Vec<String>,
    rings: HashMap<String, VecDeque<FilterSample>>,
    /// Constant for sample-based exponential averaging; recomputed per
    /// step for time-based.
    smoothing: f64,
    prev_output: HashMap<String, f64>,
    // downsample window state; the packet counter advances once per unique
    // timestamp, not per channel
    samples_recorded: u64,
    time_first_sample: u64,
    time_last_sample: u64,
    last_packet_ts: u64,
}

impl Filter {
    pub fn new(
        method: FilterMethod,
        timebase: Timebase,
        timebase_value: f64,
        channels: Vec<String>,
    ) -> Self {
        let smoothing = match (method, timebase) {
            (FilterMethod::ExponentialAverage, Timebase::Samples) => 2.0 / (timebase_value + 1.0),
            _ => 0.0,
        };
        let rings = channels
            .iter()
            .map(|name| (name.clone(), VecDeque::with_capacity(RING_RESERVE)))
            .collect();
        Self {
            method,
            timebase,
            timebase_value,
            channels,
            rings,
            smoothing,
            prev_output: HashMap::new(),
            samples_recorded: 0,
            time_first_sample: 0,
            time_last_sample: 0,
            last_packet_ts: 0,
        }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Append a sample and prune the ring to the configured window.
    pub fn update(&mut self, ts_ns: u64, value: f64, channel: &str) {
        let Some(ring) = self.rings.get_mut(channel) else {
            return;
        };
        ring.push_back(FilterSample { ts_ns, value });
        match self.timebase {
            Timebase::Time => {
                let span_ns = self.timebase_value * 1e9;
                while let Some(front) = ring.front() {
                    if ts_ns.saturating_sub(front.ts_ns) as f64 > span_ns {
                        ring.pop_front();
                    } else {
                        break;
                    }
                }
            }
            Timebase::Samples => {
                let max = self.timebase_value.max(0.0) as usize;
                while ring.len() > max {
                    ring.pop_front();
                }
            }
        }
    }

    pub fn compute(&mut self, channel: &str) -> f64 {
        match self.method {
            FilterMethod::Average => self.mean(channel),
            FilterMethod::Median => self.median(channel),
            FilterMethod::ExponentialAverage => self.exponential(channel),
            FilterMethod::DownsampleAverage => self.downsample_average(channel),
        }
    }

    /// Clear method-specific state. Rings are left alone, see
    /// [`Filter::clear_data`].
    pub fn reset(&mut self) {
        self.prev_output.clear();
        self.samples_recorded = 0;
        self.time_first_sample = 0;
        self.time_last_sample = 0;
        self.last_packet_ts = 0;
    }

    /// Empty all rings and reset, keeping the channel set. Called when
    /// sampling starts so no data spills between runs.
    pub fn clear_data(&mut self) {
        self.reset();
        for ring in self.rings.values_mut() {
            ring.clear();
        }
    }

    /// Whether the module should emit now. Always true except for the
    /// downsample-average window.
    pub fn ready_to_publish(&self) -> bool {
        if self.method != FilterMethod::DownsampleAverage {
            return true;
        }
        match self.timebase {
            Timebase::Time => {
                (self.time_last_sample.saturating_sub(self.time_first_sample)) as f64
                    >= self.timebase_value * 1e9
            }
            Timebase::Samples => self.samples_recorded as f64 >= self.timebase_value,
        }
    }

    /// Reset the downsample window after an emission.
    pub fn after_publish(&mut self) {
        self.samples_recorded = 0;
        self.time_first_sample = 0;
        self.time_last_sample = 0;
    }

    fn mean(&self, channel: &str) -> f64 {
        let Some(ring) = self.rings.get(channel) else {
            return 0.0;
        };
        if ring.is_empty() {
            return 0.0;
        }
        ring.iter().map(|s| s.value).sum::<f64>() / ring.len() as f64
    }

    fn median(&self, channel: &str) -> f64 {
        let Some(ring) = self.rings.get(channel) else {
            return 0.0;
        };
        if ring.is_empty() {
            return 0.0;
        }
        // O(n log n) per sample; fine for the window sizes in use
        let mut sorted: Vec<f64> = ring.iter().map(|s| s.value).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted[sorted.len() / 2]
    }

    fn exponential(&mut self, channel: &str) -> f64 {
        let Some(ring) = self.rings.get(channel) else {
            return 0.0;
        };
        let len = ring.len();
        if len == 0 {
            return 0.0;
        }
        let newest = ring[len - 1].value;

        let output = if len == 1 {
            newest
        } else {
            let prev = self.prev_output.get(channel).copied().unwrap_or(0.0);
            let alpha = match self.timebase {
                Timebase::Samples => self.smoothing,
                Timebase::Time => {
                    // half the step interval tracks the sample-based
                    // variant most closely
                    let dt_s =
                        (ring[len - 1].ts_ns.saturating_sub(ring[len - 2].ts_ns)) as f64 / 1e9;
                    1.0 - (-(dt_s / 2.0) / self.timebase_value).exp()
                }
            };
            alpha * newest + (1.0 - alpha) * prev
        };
        self.prev_output.insert(channel.to_string(), output);
        output
    }

    fn downsample_average(&mut self, channel: &str) -> f64 {
        let Some(ring) = self.rings.get(channel) else {
            return 0.0;
        };
        if ring.is_empty() {
            return 0.0;
        }
        let newest_ts = ring[ring.len() - 1].ts_ns;
        self.time_last_sample = newest_ts;
        if self.time_first_sample == 0 {
            self.time_first_sample = newest_ts;
        }
        if self.last_packet_ts != newest_ts {
            self.samples_recorded += 1;
            self.last_packet_ts = newest_ts;
        }
        self.mean(channel)
    }
}
