use miette::Result;

#[tokio::main]
async fn main() -> Result<()> {
	autobld::run().await
}
