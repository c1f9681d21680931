use clap::Parser;
use meshcloud_daemon::config::{Args, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::from_args(args);

    let (rpc_server, shutdown) = meshcloud_daemon::run(config).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("received ctrl-c, shutting down");
        }
        _ = shutdown.cancelled() => {}
    }

    rpc_server.stop().await;
    Ok(())
}
