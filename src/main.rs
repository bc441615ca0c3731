use anyhow::Result;
use headway::cli::App;

#[tokio::main]
async fn main() -> Result<()> {
    let args = headway::cli::Args::parse_args();
    let app = App::new();

    app.run(args).await?;

    Ok(())
}
