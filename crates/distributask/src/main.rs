mod setup;

use distributask_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Load configuration
    let config = Config::from_env()?;

    let services = crate::setup::initialize_app(&config).await?;
    crate::setup::run_until_shutdown(services).await
}
