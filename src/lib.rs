//! Smart Meter to openHAB Library
//!
//! This library decodes the SML telemetry an ISKRA MT175 electricity meter
//! streams over its optical interface, validates the decoded readings against
//! a reference to reject transmission errors, and averages them before they
//! are pushed to openHAB items.

pub mod averager;
pub mod byte_source;
pub mod config;
pub mod frame_assembler;
pub mod obis_decoder;
pub mod openhab;
pub mod read_validator;
pub mod reading;
pub mod sampler;

// Re-export commonly used types for easier access
pub use averager::average;
pub use byte_source::{ByteSource, MemoryByteSource, SerialByteSource, TransportError};
pub use config::{ConfigError, ItemNames, OpenhabConfig};
pub use frame_assembler::{AssembleOutcome, FrameAssembler, RawFrame};
pub use obis_decoder::{decode, DecodeDiagnostic, DecodedFrame};
pub use openhab::OpenhabConnection;
pub use read_validator::{
    DecodeAttempt, DumpSeries, DumpSink, FileDumpSink, ReadOutcome, ReadValidator,
    ReadValidatorConfig,
};
pub use reading::{ExtendedReading, Quantity, Reading};
pub use sampler::{MeterSampler, SampledReadings};
