//! Sensor sink: receives framed sensor readings over TCP, batches them in
//! count-or-time windows and writes each batch to a time-series store.

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod decode;
pub mod frame;
pub mod line;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod reader;
pub mod reporter;
pub mod server;
pub mod sink;
pub mod writer;

pub use aggregator::{Batch, FlushTrigger, WindowAggregator};
pub use clock::{SimulatedClock, SystemClock, WriteClock};
pub use config::{ConfigError, PipelineConfig, SensorKind, SinkServerConfig};
pub use decode::{Measurement, Noise, NoiseDecoder, RecordDecoder, Thermometer, ThermometerDecoder};
pub use frame::{Frame, FrameCodec, FrameError};
pub use pipeline::{Pipeline, PipelineHandle, PipelineStats};
pub use queue::OverflowPolicy;
pub use server::SinkServer;
pub use sink::{error_channel, ErrorReceiver, ErrorSender, MemorySink, Sink, WriteError};
