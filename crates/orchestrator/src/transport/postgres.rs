//! PostgreSQL LISTEN/NOTIFY transport.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{MESSAGE_BUFFER, PubSubTransport, TransportError, TransportMessage};

type Ack = oneshot::Sender<Result<(), sqlx::Error>>;

enum Command {
    Listen(String, Ack),
    Unlisten(String, Ack),
}

/// Transport publishing with `pg_notify` and receiving through a dedicated
/// `LISTEN` connection.
///
/// The listening connection is owned by a background task; subscription
/// changes are sent to it as commands so that receiving never holds a lock.
pub struct PgPubSub {
    pool: PgPool,
    commands: mpsc::Sender<Command>,
    sender: broadcast::Sender<TransportMessage>,
    task: JoinHandle<()>,
}

impl PgPubSub {
    /// Opens the listening connection from the pool's settings.
    pub async fn connect(pool: PgPool) -> Result<Self, TransportError> {
        let listener = PgListener::connect_with(&pool).await?;
        let (commands, command_rx) = mpsc::channel(32);
        let (sender, _) = broadcast::channel(MESSAGE_BUFFER);
        let task = tokio::spawn(run_listener(listener, command_rx, sender.clone()));
        info!("PgPubSub connected");

        Ok(Self {
            pool,
            commands,
            sender,
            task,
        })
    }

    async fn command(
        &self,
        make: impl FnOnce(Ack) -> Command,
    ) -> Result<(), TransportError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(make(ack))
            .await
            .map_err(|_| TransportError::Closed)?;
        done.await.map_err(|_| TransportError::Closed)??;
        Ok(())
    }
}

impl Drop for PgPubSub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl PubSubTransport for PgPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), TransportError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), TransportError> {
        let channel = channel.to_string();
        self.command(|ack| Command::Listen(channel, ack)).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        let channel = channel.to_string();
        self.command(|ack| Command::Unlisten(channel, ack)).await
    }

    fn messages(&self) -> broadcast::Receiver<TransportMessage> {
        self.sender.subscribe()
    }
}

async fn run_listener(
    mut listener: PgListener,
    mut commands: mpsc::Receiver<Command>,
    sender: broadcast::Sender<TransportMessage>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Listen(channel, ack)) => {
                    let result = listener.listen(&channel).await;
                    if result.is_ok() {
                        info!(channel = %channel, "LISTEN");
                    }
                    let _ = ack.send(result);
                }
                Some(Command::Unlisten(channel, ack)) => {
                    let result = listener.unlisten(&channel).await;
                    if result.is_ok() {
                        info!(channel = %channel, "UNLISTEN");
                    }
                    let _ = ack.send(result);
                }
                None => break,
            },
            notification = listener.recv() => match notification {
                Ok(notification) => {
                    let message = TransportMessage {
                        channel: notification.channel().to_string(),
                        payload: notification.payload().to_string(),
                    };
                    if sender.send(message).is_err() {
                        debug!("no receiver for notification");
                    }
                }
                Err(e) => {
                    error!(error = %e, "error receiving notification");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("PgPubSub listener stopped");
}
