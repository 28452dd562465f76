use std::collections::VecDeque;
use std::time::Duration;

use crate::time::NSECS_PER_SEC;

/// Moving average of the bitrate observed over the last few downloads.
#[derive(Debug, Clone)]
pub struct DownloadRate {
    samples: VecDeque<u64>,
    /// Sum of `samples`, wide enough that it never saturates.
    total: u128,
    max_length: usize,
}

impl DownloadRate {
    pub fn new(max_length: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_length),
            total: 0,
            max_length: max_length.max(1),
        }
    }

    /// Records a download of `bytes` that took `elapsed`.
    pub fn add_sample(&mut self, bytes: usize, elapsed: Duration) {
        let nanos = elapsed.as_nanos().max(1);
        let bitrate = (8 * NSECS_PER_SEC as u128 * bytes as u128) / nanos;
        let bitrate = u64::try_from(bitrate).unwrap_or(u64::MAX);

        self.samples.push_back(bitrate);
        self.total += u128::from(bitrate);
        self.trim();
    }

    /// Average bitrate in bits per second, `None` before the first sample.
    pub fn current_rate(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let average = self.total / self.samples.len() as u128;
        Some(u64::try_from(average).unwrap_or(u64::MAX))
    }

    fn trim(&mut self) {
        while self.samples.len() > self.max_length {
            if let Some(oldest) = self.samples.pop_front() {
                self.total -= u128::from(oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_over_window() {
        let mut rate = DownloadRate::new(2);
        assert_eq!(rate.current_rate(), None);

        rate.add_sample(1_000, Duration::from_secs(1));
        rate.add_sample(3_000, Duration::from_secs(1));
        assert_eq!(rate.current_rate(), Some(16_000));

        rate.add_sample(5_000, Duration::from_secs(1));
        assert_eq!(rate.current_rate(), Some(32_000));
    }

    #[test]
    fn huge_samples_age_out_of_the_window() {
        let mut rate = DownloadRate::new(2);
        rate.add_sample(usize::MAX, Duration::from_nanos(1));
        rate.add_sample(usize::MAX, Duration::from_nanos(1));
        assert_eq!(rate.current_rate(), Some(u64::MAX));

        rate.add_sample(1_000, Duration::from_secs(1));
        assert_eq!(rate.current_rate(), Some(u64::MAX / 2 + 4_000));
        rate.add_sample(3_000, Duration::from_secs(1));
        assert_eq!(rate.current_rate(), Some(16_000));
    }

    #[test]
    fn instant_download_does_not_divide_by_zero() {
        let mut rate = DownloadRate::new(1);
        rate.add_sample(1, Duration::ZERO);
        assert_eq!(rate.current_rate(), Some(8_000_000_000));
    }
}
