#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ecoindex_ingest::cli::run().await
}
