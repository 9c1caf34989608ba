mod api;
mod log;
mod server;

use clap::Parser;

/// Broadcast asset review server.
///
/// Serves a live-updating HLS preview of an object-store asset with a
/// burned-in timecode, plus thumbnails, waveform and loudness analysis.
#[derive(Parser, Clone)]
#[command(name = "screener")]
pub struct Cli {
	#[command(flatten)]
	log: log::Log,

	/// HTTP listen address.
	#[arg(long, env = "SCREENER_LISTEN", default_value = "[::]:8080")]
	listen: std::net::SocketAddr,

	#[command(flatten)]
	config: screener::Config,

	#[command(flatten)]
	store: screener::StoreConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	cli.log.init();

	let controller = screener::Controller::new(cli.config, cli.store).await?;

	// Processed artifacts never persist across restarts.
	controller.clean_workspace().await;

	server::serve(cli.listen, controller).await
}
