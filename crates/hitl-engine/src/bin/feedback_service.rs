use anyhow::Context;
use hitl_engine::http::read_request_head;
use hitl_engine::{init_tracing, LoopConfig, LoopContext, DEFAULT_FEEDBACK_ADDR};
use hitl_feedback::{route, FileSystemBackend, Request, Response};
use hitl_optimizer::Study;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let addr = std::env::var("HITL_FEEDBACK_ADDR").unwrap_or_else(|_| DEFAULT_FEEDBACK_ADDR.to_string());

    let exe = std::env::current_exe().context("cannot locate the running executable")?;
    let root = exe
        .parent()
        .context("executable has no parent directory")?
        .to_path_buf();
    let config = LoopConfig::rooted_at(&root);
    let (study, backend) = tokio::task::spawn_blocking(move || LoopContext::bootstrap(config))
        .await??
        .into_parts();

    let study = Arc::new(Mutex::new(study));
    let backend = Arc::new(backend);

    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "feedback service listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let study = study.clone();
        let backend = backend.clone();

        tokio::spawn(async move {
            if let Err(e) = handle(socket, study, backend).await {
                warn!(%peer, error = %e, "connection failed");
            }
        });
    }
}

async fn handle(
    mut socket: TcpStream,
    study: Arc<Mutex<Study>>,
    backend: Arc<FileSystemBackend>,
) -> anyhow::Result<()> {
    let head = read_request_head(&mut socket).await?;

    let response = match Request::parse(&head) {
        Some(request) => {
            tokio::task::spawn_blocking(move || {
                let mut study = study.lock();
                let response = route(&mut study, backend.as_ref(), &request);
                for event in study.drain_events() {
                    info!(?event, "trial event");
                }
                response
            })
            .await?
        }
        None => {
            debug!("malformed request line");
            Response::bad_request("malformed request line")
        }
    };

    socket.write_all(&response.to_http_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}
