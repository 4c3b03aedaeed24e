use bytes::{Bytes, BytesMut};
use rdma_direct::{accept, connect, BufferDescriptor, Direction, InvalidateMode, LoopbackFabric, TransportConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const BLOCK: usize = 256 * 1024;
const BLOCKS: usize = 64;

#[tokio::main]
async fn main() -> rdma_direct::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr: SocketAddr = "10.0.0.2:18516".parse().expect("valid address");
    let fabric = LoopbackFabric::new();
    let listener = fabric.listen(addr).expect("address free");

    // The server exposes a sink buffer per block and lets the client push into it.
    let server = tokio::spawn(async move {
        let conn = accept(&listener, TransportConfig::default()).await?;
        let mut received = 0usize;
        for _ in 0..BLOCKS {
            let sink = conn
                .register_memory(BytesMut::zeroed(BLOCK), Direction::FromPeer, InvalidateMode::Remote)
                .await?;
            conn.send(sink.descriptor().encode()).await?;
            conn.recv(1).await?;
            let block = sink.deregister().await?;
            received += block.len();
        }
        conn.destroy().await;
        Ok::<_, rdma_direct::Error>(received)
    });

    let client = connect(Arc::new(fabric.clone()), addr, TransportConfig::default()).await?;
    let data = Bytes::from(vec![0xa5u8; BLOCK]);
    let start = Instant::now();
    for _ in 0..BLOCKS {
        let raw = client.recv(16).await?;
        let desc = BufferDescriptor::decode(&raw).expect("descriptor");
        client.rdma_write(&desc, data.clone()).await?;
        client.send_with_invalidate(Bytes::from_static(b"."), desc.token()).await?;
    }
    let elapsed = start.elapsed();
    let received = server.await.expect("server task panicked")?;
    println!(
        "wrote {received} bytes in {elapsed:?} ({:.1} MiB/s)",
        received as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64()
    );
    println!("client stats: {:?}", client.stats());
    println!("teardown: {:?}", client.destroy().await);
    Ok(())
}
