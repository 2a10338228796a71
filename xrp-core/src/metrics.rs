use std::collections::VecDeque;
use std::time::Duration;

/// Number of samples in the rolling performance averages.
pub const PERF_WINDOW: usize = 20;

/// Rolling average over the most recent duration samples, in milliseconds.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    window: usize,
    samples: VecDeque<f32>,
    sum: f32,
}

impl Default for RollingAverage {
    fn default() -> Self {
        Self::new(PERF_WINDOW)
    }
}

impl RollingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, sample: Duration) {
        self.push_ms(sample.as_secs_f32() * 1000.0);
    }

    pub fn push_ms(&mut self, ms: f32) {
        if self.samples.len() == self.window {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(ms);
        self.sum += ms;
    }

    pub fn average_ms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.sum / self.samples.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_average_is_zero() {
        let avg = RollingAverage::new(20);
        assert_eq!(avg.average_ms(), 0.0);
    }

    #[test]
    fn test_average_of_constant_samples() {
        let mut avg = RollingAverage::new(20);
        for _ in 0..5 {
            avg.push_ms(4.0);
        }
        assert!((avg.average_ms() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut avg = RollingAverage::new(3);
        avg.push_ms(10.0);
        avg.push_ms(10.0);
        avg.push_ms(10.0);
        // Pushing three more fully replaces the window.
        avg.push_ms(1.0);
        avg.push_ms(1.0);
        avg.push_ms(1.0);
        assert!((avg.average_ms() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_push_duration() {
        let mut avg = RollingAverage::new(4);
        avg.push(Duration::from_millis(8));
        avg.push(Duration::from_millis(12));
        assert!((avg.average_ms() - 10.0).abs() < 1e-3);
    }
}
