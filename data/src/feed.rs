//! Pub/sub connection contract and the reconnecting feed driver.
//!
//! The simulator subscribes to one channel per watched symbol,
//! `trade@<symbol>@<exchange>`. The [`FeedDriver`] owns the connection
//! lifecycle: it (re)connects with the [`FEED_RECONNECT_POLICY`], replays the
//! live subscription set after every reconnect, decodes payloads, and hands
//! surviving ticks to the [`intake`](crate::intake).

use crate::{error::DataError, intake::TickerIntake, ticker::Ticker, FnvIndexSet};
use arara_markets::ExchangeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Reconnection policy for the market-data pub/sub link.
pub const FEED_RECONNECT_POLICY: FeedReconnectPolicy = FeedReconnectPolicy {
    retry_interval: Duration::from_secs(3),
    max_connect_attempts: 1000,
    max_resubscribe_attempts: 15,
};

/// How the [`FeedDriver`] behaves when the pub/sub link drops.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FeedReconnectPolicy {
    /// Delay between connection attempts.
    pub retry_interval: Duration,
    /// Connection attempts before giving up entirely.
    pub max_connect_attempts: u32,
    /// Resubscribe-all attempts on a live connection before forcing a fresh
    /// client.
    pub max_resubscribe_attempts: u32,
}

/// One `trade@<symbol>@<exchange>` pub/sub channel.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct MarketChannel {
    pub symbol: SmolStr,
    pub exchange: ExchangeId,
}

impl MarketChannel {
    pub fn new(symbol: impl Into<SmolStr>, exchange: ExchangeId) -> Self {
        Self {
            symbol: symbol.into(),
            exchange,
        }
    }

    /// Wire topic, eg/ `trade@BTCUSDT@binance`.
    pub fn topic(&self) -> String {
        format!("trade@{}@{}", self.symbol, self.exchange)
    }
}

impl Display for MarketChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "trade@{}@{}", self.symbol, self.exchange)
    }
}

impl FromStr for MarketChannel {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('@');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("trade"), Some(symbol), Some(exchange), None) => {
                let exchange = exchange
                    .parse::<ExchangeId>()
                    .map_err(|_| DataError::Channel(s.to_string()))?;
                Ok(Self::new(symbol, exchange))
            }
            _ => Err(DataError::Channel(s.to_string())),
        }
    }
}

/// Factory for pub/sub connections. The driver calls `connect` every time the
/// previous connection is lost or force-recycled.
#[async_trait]
pub trait PubSubConnector: Send + Sync + 'static {
    type Connection: PubSubConnection;

    async fn connect(&self) -> Result<Self::Connection, DataError>;
}

/// One live pub/sub connection.
#[async_trait]
pub trait PubSubConnection: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), DataError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), DataError>;

    /// Next raw message payload; `None` once the connection is lost.
    async fn recv(&mut self) -> Option<String>;
}

/// Handle used by the engine to change the live subscription set. Commands
/// are applied by the driver task; they survive reconnects because the driver
/// replays the accumulated set.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<FeedCommand>,
}

impl FeedHandle {
    pub fn subscribe(&self, channel: MarketChannel) {
        let _send = self.commands.send(FeedCommand::Subscribe(channel));
    }

    pub fn unsubscribe(&self, channel: MarketChannel) {
        let _send = self.commands.send(FeedCommand::Unsubscribe(channel));
    }
}

/// Receiving half of a [`FeedHandle`], consumed by the [`FeedDriver`].
#[derive(Debug)]
pub struct FeedCommands(mpsc::UnboundedReceiver<FeedCommand>);

/// Create the subscription command channel ahead of the driver, so the engine
/// can hold its [`FeedHandle`] while the intake is wired up to the engine.
pub fn feed_channel() -> (FeedHandle, FeedCommands) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FeedHandle { commands: tx }, FeedCommands(rx))
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum FeedCommand {
    Subscribe(MarketChannel),
    Unsubscribe(MarketChannel),
}

/// Background task owning the pub/sub subscription lifecycle.
#[derive(Debug)]
pub struct FeedDriver<Connector>
where
    Connector: PubSubConnector,
{
    connector: Connector,
    policy: FeedReconnectPolicy,
    intake: TickerIntake,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    /// Channels that must be live on the current connection; replayed in full
    /// after every reconnect.
    active: FnvIndexSet<MarketChannel>,
}

impl<Connector> FeedDriver<Connector>
where
    Connector: PubSubConnector,
{
    /// Construct a driver over a previously created [`feed_channel`]. Call
    /// [`FeedDriver::run`] on a dedicated task.
    pub fn new(
        connector: Connector,
        policy: FeedReconnectPolicy,
        intake: TickerIntake,
        commands: FeedCommands,
    ) -> Self {
        Self {
            connector,
            policy,
            intake,
            commands: commands.0,
            active: FnvIndexSet::default(),
        }
    }

    /// Drive the feed until the command channel closes or the connect budget
    /// is exhausted.
    pub async fn run(mut self) {
        let mut connect_attempts = 0u32;

        'session: loop {
            let mut connection = loop {
                match self.connector.connect().await {
                    Ok(connection) => {
                        connect_attempts = 0;
                        break connection;
                    }
                    Err(error) => {
                        connect_attempts += 1;
                        if connect_attempts >= self.policy.max_connect_attempts {
                            error!(
                                %error,
                                attempts = connect_attempts,
                                "market feed connect budget exhausted, stopping driver"
                            );
                            return;
                        }
                        warn!(%error, attempt = connect_attempts, "market feed connect failed");
                        tokio::time::sleep(self.policy.retry_interval).await;
                    }
                }
            };

            if !self.resubscribe_all(&mut connection).await {
                // Force a fresh client.
                continue 'session;
            }

            info!(channels = self.active.len(), "market feed connected");

            loop {
                tokio::select! {
                    command = self.commands.recv() => {
                        let Some(command) = command else {
                            info!("market feed handle dropped, stopping driver");
                            return;
                        };
                        self.apply(&mut connection, command).await;
                    }
                    payload = connection.recv() => {
                        let Some(payload) = payload else {
                            warn!("market feed connection lost, reconnecting");
                            continue 'session;
                        };
                        self.dispatch(&payload);
                    }
                }
            }
        }
    }

    async fn apply<Connection>(&mut self, connection: &mut Connection, command: FeedCommand)
    where
        Connection: PubSubConnection,
    {
        match command {
            FeedCommand::Subscribe(channel) => {
                if self.active.insert(channel.clone()) {
                    if let Err(error) = connection.subscribe(&channel.topic()).await {
                        // Stays in the replay set; the next reconnect retries.
                        warn!(%channel, %error, "subscribe failed");
                    }
                }
            }
            FeedCommand::Unsubscribe(channel) => {
                if self.active.shift_remove(&channel) {
                    if let Err(error) = connection.unsubscribe(&channel.topic()).await {
                        warn!(%channel, %error, "unsubscribe failed");
                    }
                }
            }
        }
    }

    /// Replay the full subscription set; false means the connection should be
    /// recycled.
    async fn resubscribe_all<Connection>(&self, connection: &mut Connection) -> bool
    where
        Connection: PubSubConnection,
    {
        for attempt in 1..=self.policy.max_resubscribe_attempts {
            let mut failed = false;
            for channel in &self.active {
                if let Err(error) = connection.subscribe(&channel.topic()).await {
                    warn!(%channel, %error, attempt, "resubscribe failed");
                    failed = true;
                    break;
                }
            }
            if !failed {
                return true;
            }
            tokio::time::sleep(self.policy.retry_interval).await;
        }
        error!(
            attempts = self.policy.max_resubscribe_attempts,
            "resubscribe budget exhausted, forcing a new client"
        );
        false
    }

    fn dispatch(&self, payload: &str) {
        match serde_json::from_str::<Ticker>(payload) {
            Ok(ticker) => self.intake.handle(ticker),
            Err(error) => warn!(%error, "discarding undecodable ticker payload"),
        }
    }
}
