// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Standalone secret subscriber: keeps an Infisical secret cache warm and
//! logs changes to the watched keys.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secret_subscriber::{SecretChange, SecretSubscriber, SubscriberConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Secret subscriber - Infisical cache with webhook updates.
#[derive(Parser, Debug)]
#[command(name = "secret-subscriber", about = "Infisical secret subscription client", version)]
struct Args {
	/// Log output format
	#[arg(long, value_enum, env = "LOG_FORMAT", default_value_t = LogFormat::Text)]
	log_format: LogFormat,

	/// Secret keys whose changes are logged (comma separated)
	#[arg(long = "watch", env = "WATCH_KEYS", value_delimiter = ',')]
	watch: Vec<String>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Show version information
	Version,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
	Text,
	Json,
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();

	if let Some(Command::Version) = args.command {
		println!("secret-subscriber {}", env!("CARGO_PKG_VERSION"));
		return Ok(());
	}

	dotenvy::dotenv().ok();
	init_tracing(args.log_format);

	let config = SubscriberConfig::from_env().context("invalid configuration")?;
	info!(
		api_url = %config.api_url,
		environment = %config.environment,
		secret_path = %config.secret_path,
		platform = ?config.platform,
		"Loaded configuration"
	);

	let subscriber = SecretSubscriber::new(config)?;
	for key in args.watch.into_iter().filter(|k| !k.trim().is_empty()) {
		subscriber.subscribe(key.trim(), log_change);
	}

	let addr = subscriber.start().await?;
	info!(%addr, secrets = subscriber.store().len(), "Listening for secret webhooks");

	tokio::signal::ctrl_c()
		.await
		.context("failed to listen for shutdown signal")?;
	info!("Received shutdown signal");

	subscriber.stop().await;
	Ok(())
}

fn init_tracing(format: LogFormat) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(filter);
	match format {
		LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
		LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
	}
}

fn log_change(change: &SecretChange) -> secret_subscriber::CallbackResult {
	let action = match (&change.old_value, &change.new_value) {
		(None, Some(_)) => "added",
		(Some(_), Some(_)) => "updated",
		(Some(_), None) => "removed",
		(None, None) => "removed (was absent)",
	};
	info!(key = %change.key, action, "Secret changed");
	Ok(())
}
