use tracing_subscriber::EnvFilter;

/// Log configuration.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct Log {
	/// Promote debug lines to the console output.
	#[arg(long, env = "SCREENER_DEBUG")]
	pub debug: bool,
}

impl Log {
	pub fn init(&self) {
		let level = if self.debug {
			tracing::Level::DEBUG
		} else {
			tracing::Level::INFO
		};

		let filter = EnvFilter::builder()
			.with_default_directive(level.into())
			.from_env_lossy()
			.add_directive("hyper=warn".parse().unwrap())
			.add_directive("aws_config=warn".parse().unwrap())
			.add_directive("aws_smithy_runtime=warn".parse().unwrap());

		tracing_subscriber::fmt().with_env_filter(filter).init();
	}
}
