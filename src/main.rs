use anyhow::Result;

use ansible_operator::runtime::initialization::initialize;
use ansible_operator::runtime::watch_loop::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    let init_result = initialize().await?;
    run_watch_loop(init_result.context).await;
    Ok(())
}
