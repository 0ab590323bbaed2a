/// Running mean of the values seen since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MovingAverage {
    total: f64,
    count: u64,
}

impl MovingAverage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Mean of the accumulated values, `None` before the first update.
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total / self.count as f64)
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_average_mean_and_reset() {
        let mut avg = MovingAverage::new();
        assert_eq!(avg.value(), None);

        avg.update(1.0);
        avg.update(2.0);
        avg.update(6.0);
        assert_eq!(avg.value(), Some(3.0));
        assert_eq!(avg.count(), 3);

        avg.reset();
        assert_eq!(avg.value(), None);
        avg.update(4.0);
        assert_eq!(avg.value(), Some(4.0));
    }
}
