use anyhow::Context;
use hitl_engine::{init_tracing, BatchController, LoopConfig, LoopContext};
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    init_tracing();

    let exe = std::env::current_exe().context("cannot locate the running executable")?;
    let root = exe
        .parent()
        .context("executable has no parent directory")?
        .to_path_buf();
    info!(root = %root.display(), "human-in-the-loop optimization starting");

    let ctx = LoopContext::bootstrap(LoopConfig::rooted_at(&root))?;
    let mut controller = BatchController::new(ctx);

    match controller.run() {
        Ok(never) => match never {},
        Err(e) => {
            error!(error = %e, "batch loop stopped");
            Err(e.into())
        }
    }
}
