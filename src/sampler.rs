use crate::averager::average;
use crate::byte_source::ByteSource;
use crate::read_validator::ReadValidator;
use crate::reading::{ExtendedReading, Quantity, Reading};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Averaged reading of one sampling window plus the values derived from it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampledReadings {
    pub reading: Reading,
    pub extended: ExtendedReading,
    /// How many reads of the window were trusted
    pub trusted_reads: usize,
}

/// Takes several validated reads and combines them into one reading
pub struct MeterSampler<S: ByteSource> {
    validator: ReadValidator<S>,
    pause_between_reads: Duration,
    previous_meter_kwh: Option<f64>,
}

impl<S: ByteSource> MeterSampler<S> {
    pub fn new(validator: ReadValidator<S>) -> Self {
        Self {
            validator,
            pause_between_reads: Duration::from_secs(1),
            previous_meter_kwh: None,
        }
    }

    pub fn with_pause(mut self, pause_between_reads: Duration) -> Self {
        self.pause_between_reads = pause_between_reads;
        self
    }

    /// Performs `read_count` validated reads and averages the trusted ones.
    ///
    /// Falls back to the default reading if none of them could be trusted,
    /// so a single failed read does not drag the average towards zero.
    pub fn read_avg(&mut self, read_count: usize, reference: &Reading) -> SampledReadings {
        let mut trusted = Vec::with_capacity(read_count);

        for i in 0..read_count {
            let outcome = self.validator.try_read(reference);
            if outcome.is_trusted() {
                trusted.push(outcome.into_reading());
            }
            if i + 1 < read_count {
                thread::sleep(self.pause_between_reads);
            }
        }

        let reading = if trusted.is_empty() {
            warn!("None of {read_count} reads could be trusted, using default reading");
            Reading::default_reading()
        } else {
            average(&trusted)
        };

        let current_meter_kwh = reading.get(Quantity::ElectricityMeter);
        let extended = ExtendedReading::from_meter_delta(self.previous_meter_kwh, current_meter_kwh);
        if current_meter_kwh.is_some_and(|kwh| kwh > 0.0) {
            self.previous_meter_kwh = current_meter_kwh;
        }

        info!(
            "Averaged {} of {read_count} reads: {reading} {extended}",
            trusted.len()
        );

        SampledReadings {
            reading,
            extended,
            trusted_reads: trusted.len(),
        }
    }
}
