// TCP accept loop: one agent per accepted connection.
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;

use crate::agent::{AgentFactory, run_read_loop};
use crate::router::Router;

pub async fn serve(
    listener: TcpListener,
    factory: Arc<AgentFactory>,
    router: Arc<dyn Router>,
) -> Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        if let Err(err) = socket.set_nodelay(true) {
            tracing::debug!(error = %err, "set_nodelay failed");
        }
        let factory = Arc::clone(&factory);
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            let (agent, read_half) = factory.create(socket, Some(peer));
            tracing::debug!(
                peer = %peer,
                session_id = agent.session().id(),
                "client connected"
            );
            tokio::spawn(run_read_loop(Arc::clone(&agent), router, read_half));
            agent.handle().await;
            tracing::debug!(peer = %peer, "client disconnected");
        });
    }
}
