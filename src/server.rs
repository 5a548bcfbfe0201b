//! Sink Server
//!
//! Accepts sensor connections and hands each one's frame stream to the
//! pipeline. One reader task per connection; a misbehaving connection only
//! ends itself.

use crate::decode::RecordDecoder;
use crate::frame::FrameCodec;
use crate::pipeline::{PipelineHandle, PipelineStats};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::codec::FramedRead;
use tracing::{error, info};

pub struct SinkServer<D: RecordDecoder> {
    listener: TcpListener,
    pipeline: PipelineHandle<D>,
}

impl<D: RecordDecoder> SinkServer<D> {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        pipeline: PipelineHandle<D>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(SinkServer { listener, pipeline })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then drain the pipeline
    pub async fn run_until<F>(self, shutdown: F) -> PipelineStats
    where
        F: Future<Output = ()>,
    {
        let SinkServer { listener, pipeline } = self;
        if let Ok(addr) = listener.local_addr() {
            info!("Sink server listening on {}", addr);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            // Enable TCP_NODELAY for lower latency
                            let _ = stream.set_nodelay(true);
                            let frames = FramedRead::new(stream, FrameCodec::new());
                            pipeline.spawn_reader(frames, addr.to_string());
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        // Stop accepting before draining
        drop(listener);
        pipeline.shutdown().await
    }
}
