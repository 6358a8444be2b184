use fastrand::Rng;

/// Drops received packets with a fixed probability
#[derive(Clone, Debug)]
pub struct RateErrorModel {
    rate: f64,
}

impl RateErrorModel {
    pub fn new(rate: f64) -> Self {
        Self { rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub(crate) fn set_rate(&mut self, rate: f64) {
        self.rate = rate;
    }

    /// Rolls the dice for a single packet
    pub(crate) fn is_corrupt(&self, rng: &mut Rng) -> bool {
        // A zero rate never consumes randomness
        self.rate > 0.0 && rng.f64() < self.rate
    }
}
