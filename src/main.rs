//! Sensor Sink Server
//!
//! Receives framed sensor readings over TCP and writes them to InfluxDB in
//! count-or-time batches. One process serves one measurement kind.
//!
//! Configuration comes from the file named by SINK_CONFIG (TOML) if set,
//! otherwise from environment variables; see `sensor_sink::config`.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use sensor_sink::config::{ConfigError, SensorKind, SinkServerConfig};
use sensor_sink::observability::init_tracing;
use sensor_sink::sink::{error_channel, InfluxSink};
use sensor_sink::{NoiseDecoder, Pipeline, RecordDecoder, SinkServer, SystemClock, ThermometerDecoder};
use tokio::signal;
use tracing::{error, info};

fn load_config() -> Result<SinkServerConfig, ConfigError> {
    match std::env::var("SINK_CONFIG") {
        Ok(path) if !path.trim().is_empty() => SinkServerConfig::from_toml_file(path),
        _ => SinkServerConfig::from_env(),
    }
}

async fn run<D: RecordDecoder>(
    config: SinkServerConfig,
    decoder: D,
) -> Result<(), Box<dyn std::error::Error>> {
    let (errors, error_rx) = error_channel(config.pipeline.error_queue_capacity);
    let sink = InfluxSink::new(&config.influx, errors)?;
    info!("Writing to {}", sink.write_url());

    let pipeline = Pipeline::spawn(&config.pipeline, decoder, SystemClock, sink, error_rx);
    let server = SinkServer::bind(config.listen_addr.as_str(), pipeline).await?;

    let stats = server
        .run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await;

    info!(
        "Server shutdown complete: {} frames, {} decode errors, {} dropped, {} records written, {} write errors",
        stats.readers.frames,
        stats.readers.decode_errors,
        stats.readers.dropped,
        stats.writer.records,
        stats.write_errors
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    init_tracing(&config.log).map_err(|e| format!("failed to initialize tracing: {}", e))?;

    if let Err(e) = config.validate() {
        error!("{}", e);
        return Err(e.into());
    }

    info!(
        "Starting {:?} sink on {} (bucket {}, org {})",
        config.kind, config.listen_addr, config.influx.bucket, config.influx.org
    );

    match config.kind {
        SensorKind::Noise => run(config, NoiseDecoder).await,
        SensorKind::Thermometer => run(config, ThermometerDecoder).await,
    }
}
