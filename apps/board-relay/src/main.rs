use std::sync::Arc;

use anyhow::{Context, Result};
use board_relay::api::RestBoardApi;
use board_relay::chat::{IrcClient, IrcConfig};
use board_relay::config::{Cli, Config};
use board_relay::dispatch::spawn_dispatcher;
use board_relay::relay::{ChatSink, Relay, Subscription};
use board_relay::telemetry;
use board_stream::{StreamClient, StreamConfig, WebSocketConnector};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    telemetry::init_tracing(&config.log_filter)?;
    info!(
        boards = config.subscriptions.len(),
        irc_host = %config.irc.host,
        "starting board-relay"
    );
    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let api = Arc::new(RestBoardApi::new(
        config.api_base_url()?,
        config.application.key.clone(),
        config.application.token.clone(),
    ));

    let irc = IrcConfig::new(
        config.irc.host.clone(),
        config.irc.port,
        config.irc.nick.clone(),
    )
    .with_password(config.irc.password.clone());
    let (chat, chat_events) = IrcClient::spawn(irc);

    let (gate_tx, gate_rx) = watch::channel(false);
    let sink = Arc::new(ChatSink::new(Arc::new(chat)));
    let (dispatch, dispatcher) = spawn_dispatcher(sink, config.tick(), gate_rx);

    let connector = Arc::new(
        WebSocketConnector::new(&config.stream.base_url)
            .context("failed to build stream connector")?,
    );
    let token = config
        .stream_token()
        .context("stream token missing")?
        .to_string();
    let stream_config = StreamConfig::new(token).with_rpc_timeout(config.rpc_timeout());

    let mut relay =
        Relay::new(api, dispatch, gate_tx).with_short_link_timeout(config.short_link_timeout());
    for subscription in &config.subscriptions {
        let (client, events) = StreamClient::new(stream_config.clone(), connector.clone());
        relay.watch(
            Subscription {
                board: subscription.board.clone(),
                channel: subscription.channel.clone(),
                charset: subscription.charset.clone(),
                delay: subscription.delay(),
            },
            client,
            events,
        );
    }

    relay.run(chat_events, shutdown_signal()).await;
    dispatcher.abort();
    info!("board-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
