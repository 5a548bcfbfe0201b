//! Sensors connecting over real TCP sockets.

use bytes::BytesMut;
use sensor_sink::config::PipelineConfig;
use sensor_sink::frame::{Frame, DEFAULT_OBSERVE_TAG};
use sensor_sink::pipeline::Pipeline;
use sensor_sink::server::SinkServer;
use sensor_sink::sink::{error_channel, MemorySink};
use sensor_sink::{NoiseDecoder, SimulatedClock};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

fn encode(frames: &[Frame]) -> BytesMut {
    let mut buf = BytesMut::new();
    for frame in frames {
        frame.encode_to(&mut buf);
    }
    buf
}

fn noise(value: f32) -> Frame {
    Frame::new(DEFAULT_OBSERVE_TAG, value.to_be_bytes().to_vec())
}

#[tokio::test]
async fn test_tcp_sensors_to_sink() {
    let config = PipelineConfig::test();
    let (errors, error_rx) = error_channel(config.error_queue_capacity);
    let (sink, flushed) = MemorySink::new(errors);
    let pipeline = Pipeline::spawn(&config, NoiseDecoder, SimulatedClock::new(100), sink, error_rx);

    let server = SinkServer::bind("127.0.0.1:0", pipeline).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    // Overlong length varint: this connection fails on its own
    let mut broken = TcpStream::connect(addr).await.unwrap();
    broken
        .write_all(&[DEFAULT_OBSERVE_TAG, 0xff, 0xff, 0xff, 0xff])
        .await
        .unwrap();

    let mut sensor = TcpStream::connect(addr).await.unwrap();
    let bytes = encode(&[
        noise(1.0),
        Frame::new(0x7f, b"ping".to_vec()),
        noise(2.0),
        noise(3.0),
    ]);
    // Split mid-frame to exercise partial reads
    sensor.write_all(&bytes[..3]).await.unwrap();
    sensor.flush().await.unwrap();
    sensor.write_all(&bytes[3..]).await.unwrap();

    flushed.wait_for(1).await;
    assert_eq!(
        flushed.batches(),
        vec![vec![
            "noise_sensor val=1.000000 100".to_string(),
            "noise_sensor val=2.000000 100".to_string(),
            "noise_sensor val=3.000000 100".to_string(),
        ]]
    );

    stop_tx.send(()).unwrap();
    let stats = server.await.unwrap();

    assert_eq!(stats.readers.connections, 2);
    assert_eq!(stats.readers.skipped, 1);
    assert_eq!(stats.aggregator.count_flushes, 1);
    assert_eq!(stats.writer.records, 3);
    assert_eq!(stats.write_errors, 0);
}

#[tokio::test]
async fn test_shutdown_with_open_connection() {
    let config = PipelineConfig::test();
    let (errors, error_rx) = error_channel(config.error_queue_capacity);
    let (sink, flushed) = MemorySink::new(errors);
    let pipeline = Pipeline::spawn(&config, NoiseDecoder, SimulatedClock::default(), sink, error_rx);

    let server = SinkServer::bind("127.0.0.1:0", pipeline).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    let mut sensor = TcpStream::connect(addr).await.unwrap();
    sensor
        .write_all(&encode(&[noise(1.0), noise(2.0), noise(3.0)]))
        .await
        .unwrap();
    flushed.wait_for(1).await;

    // The sensor stays connected; shutdown must not wait on it
    stop_tx.send(()).unwrap();
    let stats = server.await.unwrap();

    assert_eq!(stats.readers.connections, 1);
    assert_eq!(stats.writer.batches, 1);
    drop(sensor);
}
