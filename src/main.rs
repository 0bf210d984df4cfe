#[tokio::main]
async fn main() -> anyhow::Result<()> {
    amybot::run_bot().await
}
