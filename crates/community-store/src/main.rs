#[tokio::main]
async fn main() -> anyhow::Result<()> {
    community_store::run().await
}
