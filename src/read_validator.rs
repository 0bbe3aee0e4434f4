use crate::byte_source::{ByteSource, TransportError};
use crate::frame_assembler::{AssembleOutcome, FrameAssembler, RawFrame};
use crate::obis_decoder::{decode, DecodedFrame};
use crate::reading::{Quantity, Reading};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tuning of the validated read loop
#[derive(Debug, Clone, PartialEq)]
pub struct ReadValidatorConfig {
    /// Frames to try before falling back to the default reading
    pub max_attempts: u32,
    /// Wall clock time one attempt may spend waiting for a complete frame
    pub time_budget: Duration,
    /// Upper bound for a single blocking read of the byte source
    pub chunk_timeout: Duration,
    /// A value is an outlier if `value * outlier_scale` exceeds the reference
    pub outlier_scale: f64,
    /// Lower bound for the reference so values near zero don't trip the outlier check
    pub min_reference_floor: f64,
}

impl Default for ReadValidatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            time_budget: Duration::from_secs(5),
            chunk_timeout: Duration::from_secs(1),
            outlier_scale: 0.001,
            min_reference_floor: 50.0,
        }
    }
}

/// The two kinds of rejected frames that get dumped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpSeries {
    Invalid,
    Outlier,
}

impl DumpSeries {
    pub fn name(self) -> &'static str {
        match self {
            DumpSeries::Invalid => "invalid",
            DumpSeries::Outlier => "outlier",
        }
    }
}

impl fmt::Display for DumpSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives raw frames of rejected attempts for offline protocol debugging
pub trait DumpSink {
    fn store(&mut self, series: DumpSeries, sequence: u32, raw: &[u8]) -> io::Result<()>;
}

/// Writes every dumped frame as `<series>_<sequence>.sml` hex text into a directory
pub struct FileDumpSink {
    dir: PathBuf,
}

impl FileDumpSink {
    /// Creates the directory if needed
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, series: DumpSeries, sequence: u32) -> PathBuf {
        self.dir.join(format!("{}_{}.sml", series.name(), sequence))
    }
}

impl DumpSink for FileDumpSink {
    fn store(&mut self, series: DumpSeries, sequence: u32, raw: &[u8]) -> io::Result<()> {
        let path = self.path_for(series, sequence);
        fs::write(&path, hex::encode(raw))?;
        info!("Dumped {series} frame to {}", path.display());
        Ok(())
    }
}

/// What a single assemble and decode cycle produced
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeAttempt {
    Success { reading: Reading, frame: RawFrame },
    /// No complete frame arrived within the time budget
    Incomplete,
    /// A frame arrived but not every field could be decoded
    Malformed {
        decoded: DecodedFrame,
        frame: RawFrame,
    },
}

impl DecodeAttempt {
    /// Decodes a frame and classifies the result
    pub fn from_frame(frame: RawFrame) -> Self {
        let decoded = decode(&frame);
        if decoded.is_complete() {
            DecodeAttempt::Success {
                reading: decoded.reading,
                frame,
            }
        } else {
            DecodeAttempt::Malformed { decoded, frame }
        }
    }

    /// The decoded values, all absent if no frame was received
    pub fn reading(&self) -> Reading {
        match self {
            DecodeAttempt::Success { reading, .. } => *reading,
            DecodeAttempt::Incomplete => Reading::empty(),
            DecodeAttempt::Malformed { decoded, .. } => decoded.reading,
        }
    }

    pub fn frame(&self) -> Option<&RawFrame> {
        match self {
            DecodeAttempt::Success { frame, .. } | DecodeAttempt::Malformed { frame, .. } => {
                Some(frame)
            }
            DecodeAttempt::Incomplete => None,
        }
    }
}

/// Result of a validated read
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// A valid reading that passed the outlier check
    Trusted { reading: Reading, attempts: u32 },
    /// Every attempt failed
    Exhausted { attempts: u32 },
}

impl ReadOutcome {
    /// The trusted reading, or the all-zero default reading
    pub fn into_reading(self) -> Reading {
        match self {
            ReadOutcome::Trusted { reading, .. } => reading,
            ReadOutcome::Exhausted { .. } => Reading::default_reading(),
        }
    }

    pub fn is_trusted(&self) -> bool {
        matches!(self, ReadOutcome::Trusted { .. })
    }
}

/// Checks a single value against its reference.
/// The boundary case `candidate * scale == max(reference, floor)` is not an outlier.
pub fn is_outlier(candidate: f64, reference: f64, scale: f64, floor: f64) -> bool {
    candidate * scale > reference.max(floor)
}

/// Quantities whose candidate value is implausible compared to the reference.
/// Quantities absent in either reading are not checked.
pub fn find_outliers(
    candidate: &Reading,
    reference: &Reading,
    config: &ReadValidatorConfig,
) -> Vec<Quantity> {
    Quantity::ALL
        .iter()
        .copied()
        .filter(|q| match (candidate.get(*q), reference.get(*q)) {
            (Some(value), Some(reference_value)) => is_outlier(
                value,
                reference_value,
                config.outlier_scale,
                config.min_reference_floor,
            ),
            _ => false,
        })
        .collect()
}

/// Produces trustworthy readings from a byte source by retrying
/// assemble and decode cycles until one passes the validity and outlier checks
pub struct ReadValidator<S: ByteSource> {
    source: S,
    config: ReadValidatorConfig,
    assembler: FrameAssembler,
    dump_sink: Option<Box<dyn DumpSink + Send>>,
    invalid_dumps: u32,
    outlier_dumps: u32,
}

impl<S: ByteSource> ReadValidator<S> {
    pub fn new(source: S, config: ReadValidatorConfig) -> Self {
        let assembler = FrameAssembler::new(config.chunk_timeout);
        Self {
            source,
            config,
            assembler,
            dump_sink: None,
            invalid_dumps: 0,
            outlier_dumps: 0,
        }
    }

    /// Enables dumping of rejected frames
    pub fn with_dump_sink(mut self, sink: Box<dyn DumpSink + Send>) -> Self {
        self.dump_sink = Some(sink);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Runs one assemble and decode cycle
    pub fn attempt(&mut self) -> Result<DecodeAttempt, TransportError> {
        match self
            .assembler
            .assemble(&mut self.source, self.config.time_budget)?
        {
            AssembleOutcome::Frame(frame) => Ok(DecodeAttempt::from_frame(frame)),
            AssembleOutcome::Incomplete => Ok(DecodeAttempt::Incomplete),
        }
    }

    /// Reads until a reading is both valid and not an outlier compared to
    /// `reference`, or the attempt budget is used up
    pub fn try_read(&mut self, reference: &Reading) -> ReadOutcome {
        let max_attempts = self.config.max_attempts;

        for attempt in 1..=max_attempts {
            let outcome = match self.attempt() {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Read attempt {attempt}/{max_attempts}: transport failure: {e}");
                    continue;
                }
            };

            match &outcome {
                DecodeAttempt::Incomplete => {
                    debug!(
                        "Read attempt {attempt}/{max_attempts}: no complete frame within {:?}",
                        self.config.time_budget
                    );
                    continue;
                }
                DecodeAttempt::Malformed { decoded, .. } => {
                    for diagnostic in &decoded.diagnostics {
                        debug!("Read attempt {attempt}/{max_attempts}: {diagnostic}");
                    }
                }
                DecodeAttempt::Success { .. } => {}
            }
            let reading = outcome.reading();

            if reading.is_invalid() {
                debug!("Read attempt {attempt}/{max_attempts}: invalid reading {reading}");
                self.dump(DumpSeries::Invalid, outcome.frame());
                continue;
            }

            let outliers = find_outliers(&reading, reference, &self.config);
            if !outliers.is_empty() {
                debug!(
                    "Read attempt {attempt}/{max_attempts}: outlier in {outliers:?}, read {reading}, reference {reference}"
                );
                self.dump(DumpSeries::Outlier, outcome.frame());
                continue;
            }

            return ReadOutcome::Trusted {
                reading,
                attempts: attempt,
            };
        }

        warn!("No trustworthy reading after {max_attempts} attempts");
        ReadOutcome::Exhausted {
            attempts: max_attempts,
        }
    }

    /// Like [`ReadValidator::try_read`], but hands out the all-zero default
    /// reading when every attempt failed
    pub fn read(&mut self, reference: &Reading) -> Reading {
        self.try_read(reference).into_reading()
    }

    fn dump(&mut self, series: DumpSeries, frame: Option<&RawFrame>) {
        let (Some(sink), Some(frame)) = (self.dump_sink.as_mut(), frame) else {
            return;
        };
        let counter = match series {
            DumpSeries::Invalid => &mut self.invalid_dumps,
            DumpSeries::Outlier => &mut self.outlier_dumps,
        };
        *counter += 1;
        if let Err(e) = sink.store(series, *counter, &frame.to_bytes()) {
            warn!("Failed to dump {series} frame {}: {e}", *counter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_source::MemoryByteSource;
    use std::sync::{Arc, Mutex};

    const VALID: &str = include_str!("../tests/data/iskra_mt175_valid.sml");
    const OUTLIER: &str = include_str!("../tests/data/iskra_mt175_outlier.sml");

    type Stored = Arc<Mutex<Vec<(DumpSeries, u32, Vec<u8>)>>>;

    /// Dump sink that keeps everything in memory
    struct RecordingSink {
        stored: Stored,
    }

    impl DumpSink for RecordingSink {
        fn store(&mut self, series: DumpSeries, sequence: u32, raw: &[u8]) -> io::Result<()> {
            self.stored
                .lock()
                .unwrap()
                .push((series, sequence, raw.to_vec()));
            Ok(())
        }
    }

    fn test_config() -> ReadValidatorConfig {
        ReadValidatorConfig {
            time_budget: Duration::from_millis(50),
            chunk_timeout: Duration::from_millis(5),
            ..ReadValidatorConfig::default()
        }
    }

    fn source_with(frames: &[&str]) -> MemoryByteSource {
        let mut source = MemoryByteSource::new();
        for frame in frames {
            source.push_stream(&hex::decode(frame).unwrap(), 64);
        }
        source
    }

    fn missing_phase_3() -> String {
        VALID.replace("0701004c0700ff", "0701004d0700ff")
    }

    #[test]
    fn test_default_config() {
        let config = ReadValidatorConfig::default();
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.time_budget, Duration::from_secs(5));
        assert_eq!(config.min_reference_floor, 50.0);
        assert_eq!(config.outlier_scale, 0.001);
    }

    #[test]
    fn test_decode_attempt_classification() {
        let success = DecodeAttempt::from_frame(RawFrame::from_hex(VALID).unwrap());
        assert!(matches!(success, DecodeAttempt::Success { .. }));
        assert_eq!(
            success.reading(),
            Reading::new(131.0, 19.0, 13.0, 163.0, 18999.0194)
        );

        let malformed = DecodeAttempt::from_frame(RawFrame::from_hex(&missing_phase_3()).unwrap());
        assert!(matches!(malformed, DecodeAttempt::Malformed { .. }));
        assert_eq!(malformed.reading().get(Quantity::Phase3), None);
        assert_eq!(malformed.reading().get(Quantity::Overall), Some(163.0));
        assert!(malformed.frame().is_some());

        assert!(DecodeAttempt::Incomplete.reading().is_empty());
        assert_eq!(DecodeAttempt::Incomplete.frame(), None);
    }

    #[test]
    fn test_outlier_rule() {
        // 60000 * 0.001 = 60 > max(40, 50)
        assert!(is_outlier(60000.0, 40.0, 0.001, 50.0));
        // 49000 * 0.001 = 49 <= 50
        assert!(!is_outlier(49000.0, 40.0, 0.001, 50.0));
        // Boundary is accepted
        assert!(!is_outlier(50000.0, 40.0, 0.001, 50.0));
        assert!(is_outlier(50001.0, 40.0, 0.001, 50.0));
        // Larger reference raises the bar
        assert!(!is_outlier(60000.0, 100.0, 0.001, 50.0));
    }

    #[test]
    fn test_find_outliers_skips_absent_values() {
        let config = ReadValidatorConfig::default();
        let candidate = Reading::new(60000.0, 60000.0, 1.0, 1.0, 1.0);
        let reference = Reading::empty().with(Quantity::Phase1, Some(40.0));
        assert_eq!(
            find_outliers(&candidate, &reference, &config),
            vec![Quantity::Phase1]
        );
        assert!(find_outliers(&candidate, &Reading::empty(), &config).is_empty());
    }

    #[test]
    fn test_read_valid_frame_first_attempt() {
        let mut validator = ReadValidator::new(source_with(&[VALID]), test_config());
        let outcome = validator.try_read(&Reading::empty());
        assert_eq!(
            outcome,
            ReadOutcome::Trusted {
                reading: Reading::new(131.0, 19.0, 13.0, 163.0, 18999.0194),
                attempts: 1
            }
        );
    }

    #[test]
    fn test_retry_after_malformed_frame() {
        let broken = missing_phase_3();
        let mut validator = ReadValidator::new(source_with(&[&broken, VALID]), test_config());
        let outcome = validator.try_read(&Reading::empty());
        assert!(matches!(outcome, ReadOutcome::Trusted { attempts: 2, .. }));
    }

    #[test]
    fn test_outlier_is_rejected_against_reference() {
        let reference = Reading::new(100.0, 20.0, 10.0, 160.0, 18999.0);
        let mut validator = ReadValidator::new(source_with(&[OUTLIER, VALID]), test_config());
        let outcome = validator.try_read(&reference);
        assert_eq!(
            outcome,
            ReadOutcome::Trusted {
                reading: Reading::new(131.0, 19.0, 13.0, 163.0, 18999.0194),
                attempts: 2
            }
        );
    }

    #[test]
    fn test_outlier_passes_without_reference() {
        let mut validator = ReadValidator::new(source_with(&[OUTLIER]), test_config());
        let reading = validator.read(&Reading::empty());
        assert_eq!(reading.get(Quantity::Overall), Some(2734782215.0));
    }

    #[test]
    fn test_exhausted_attempts_return_default_reading() {
        let broken = missing_phase_3();
        let frames = [broken.as_str(); 4];
        let mut validator = ReadValidator::new(source_with(&frames), test_config());
        let outcome = validator.try_read(&Reading::empty());
        assert_eq!(outcome, ReadOutcome::Exhausted { attempts: 4 });
        assert_eq!(outcome.into_reading(), Reading::default_reading());
    }

    #[test]
    fn test_silent_line_returns_default_reading() {
        let config = ReadValidatorConfig {
            max_attempts: 2,
            time_budget: Duration::from_millis(20),
            chunk_timeout: Duration::from_millis(5),
            ..ReadValidatorConfig::default()
        };
        let mut validator = ReadValidator::new(MemoryByteSource::new(), config);
        let reading = validator.read(&Reading::empty());
        assert_eq!(reading, Reading::default_reading());
        assert!(!reading.is_invalid());
    }

    #[test]
    fn test_transport_failure_counts_as_attempt() {
        let mut source = MemoryByteSource::new();
        source.push_error(TransportError::Disconnected);
        source.push_stream(&hex::decode(VALID).unwrap(), 64);
        let mut validator = ReadValidator::new(source, test_config());
        let outcome = validator.try_read(&Reading::empty());
        assert!(matches!(outcome, ReadOutcome::Trusted { attempts: 2, .. }));
    }

    #[test]
    fn test_transport_failures_exhaust_budget() {
        let mut source = MemoryByteSource::new();
        for _ in 0..4 {
            source.push_error(TransportError::Disconnected);
        }
        source.push_stream(&hex::decode(VALID).unwrap(), 64);
        let mut validator = ReadValidator::new(source, test_config());
        assert_eq!(validator.read(&Reading::empty()), Reading::default_reading());
        // The valid frame behind the failures was never consumed
        assert!(!validator.source().is_exhausted());
    }

    #[test]
    fn test_zero_attempts() {
        let config = ReadValidatorConfig {
            max_attempts: 0,
            ..test_config()
        };
        let mut validator = ReadValidator::new(source_with(&[VALID]), config);
        assert_eq!(
            validator.try_read(&Reading::empty()),
            ReadOutcome::Exhausted { attempts: 0 }
        );
        assert_eq!(validator.into_source().read_count(), 0);
    }

    #[test]
    fn test_rejected_frames_are_dumped_per_series() {
        let stored: Stored = Arc::default();
        let sink = RecordingSink {
            stored: stored.clone(),
        };
        let broken = missing_phase_3();
        let reference = Reading::new(100.0, 20.0, 10.0, 160.0, 18999.0);
        let mut validator = ReadValidator::new(
            source_with(&[&broken, OUTLIER, &broken, VALID]),
            test_config(),
        )
        .with_dump_sink(Box::new(sink));

        assert!(validator.try_read(&reference).is_trusted());

        let stored = stored.lock().unwrap();
        let series: Vec<(DumpSeries, u32)> = stored.iter().map(|(s, n, _)| (*s, *n)).collect();
        assert_eq!(
            series,
            vec![
                (DumpSeries::Invalid, 1),
                (DumpSeries::Outlier, 1),
                (DumpSeries::Invalid, 2)
            ]
        );
        assert_eq!(stored[1].2, hex::decode(OUTLIER).unwrap());
    }

    #[test]
    fn test_successful_read_is_not_dumped() {
        let stored: Stored = Arc::default();
        let sink = RecordingSink {
            stored: stored.clone(),
        };
        let mut validator =
            ReadValidator::new(source_with(&[VALID]), test_config()).with_dump_sink(Box::new(sink));
        assert!(validator.try_read(&Reading::empty()).is_trusted());
        assert!(stored.lock().unwrap().is_empty());
    }

    #[test]
    fn test_file_dump_sink_writes_hex() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileDumpSink::new(dir.path().join("dumps")).unwrap();
        sink.store(DumpSeries::Outlier, 3, &[0x1b, 0x1b, 0x01])
            .unwrap();

        let path = sink.path_for(DumpSeries::Outlier, 3);
        assert!(path.ends_with("outlier_3.sml"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "1b1b01");

        // Dumps can be replayed through the decoder
        let frame = RawFrame::from_hex(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(frame.to_bytes(), vec![0x1b, 0x1b, 0x01]);
    }
}
