use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::api;

pub struct AppState {
	pub controller: screener::Controller,
}

pub async fn serve(listen: SocketAddr, controller: screener::Controller) -> anyhow::Result<()> {
	let state = Arc::new(AppState { controller });

	let app = Router::new()
		.route("/videos", get(api::list))
		.route("/video/abort-all", post(api::abort_all))
		.route("/video/{key}/info", get(api::info))
		.route("/video/{key}/playlist.m3u8", get(api::playlist))
		.route("/video/{key}/thumbnails", get(api::thumbnails))
		.route("/video/{key}/waveform", get(api::waveform))
		.route("/video/{key}/ebu-r128", get(api::ebu_r128))
		.route("/video/{key}/progress", get(api::progress))
		.route("/video/{key}/stream", get(api::stream))
		.route("/video/{key}/abort", post(api::abort))
		.route("/video/{key}/{artifact}", get(api::artifact))
		.layer(
			CorsLayer::new()
				.allow_origin(Any)
				.allow_methods([Method::GET, Method::POST]),
		)
		.with_state(state.clone());

	let listener = tokio::net::TcpListener::bind(listen)
		.await
		.context("failed to bind listen address")?;
	tracing::info!(addr = %listen, "listening");

	// Notify systemd that we're ready.
	#[cfg(unix)]
	let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown())
		.await?;

	// Leave no transcoder children behind.
	state.controller.abort_all().await;

	Ok(())
}

async fn shutdown() {
	let ctrl_c = tokio::signal::ctrl_c();

	#[cfg(unix)]
	{
		let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install signal handler");

		tokio::select! {
			_ = ctrl_c => tracing::info!("received ctrl-c, terminating"),
			_ = terminate.recv() => tracing::info!("received SIGTERM, terminating"),
		}
	}

	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
		tracing::info!("received ctrl-c, terminating");
	}
}
