use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    cryptpilot_provision::run().await
}
