//! Event router: board streams in, coalesced chat notices out.
//!
//! A single task owns the route table and the member cache. Stream
//! events, subscription results and metadata lookups all arrive through
//! one inbox. Slow work (RPCs, REST calls) runs in spawned tasks that
//! report back to the inbox or, for short links, enqueue straight into
//! the dispatcher.

pub mod translate;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use board_stream::{StreamClient, StreamError, StreamEvent, StreamEvents};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::api::{ApiError, Board, BoardApi, Member};
use crate::charset::{self, CharsetError};
use crate::chat::{ChatError, ChatEvent, ChatTransport};
use crate::delta::Delta;
use crate::dispatch::{Deliverable, DeliverySink, DispatchHandle, QueueEntry};

use self::translate::{classify, BoardAction, Notification};

const DEFAULT_SHORT_LINK_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue payload headed for the chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Join {
        channel: String,
    },
    Notice {
        channel: String,
        charset: Option<String>,
        delta: Delta,
    },
}

/// `(channel, card id, actor)`.
pub type MergeKey = (String, String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Join {
        channel: String,
    },
    Notice {
        channel: String,
        charset: Option<String>,
        text: String,
    },
}

impl Deliverable for Outbound {
    type Key = MergeKey;
    type Output = ChatCommand;

    fn merge_key(&self) -> Option<MergeKey> {
        match self {
            Outbound::Join { .. } => None,
            Outbound::Notice { channel, delta, .. } => Some((
                channel.clone(),
                delta.subject_id.clone(),
                delta.actor_id.clone(),
            )),
        }
    }

    fn merge_with(self, later: Self) -> Self {
        match (self, later) {
            (
                Outbound::Notice { delta: first, .. },
                Outbound::Notice {
                    channel,
                    charset,
                    delta: second,
                },
            ) if first.is_mergeable_with(&second) => Outbound::Notice {
                channel,
                charset,
                delta: first.merge(&second),
            },
            (_, later) => later,
        }
    }

    fn render(&self) -> Option<ChatCommand> {
        match self {
            Outbound::Join { channel } => Some(ChatCommand::Join {
                channel: channel.clone(),
            }),
            Outbound::Notice {
                channel,
                charset,
                delta,
            } => delta.render().map(|text| ChatCommand::Notice {
                channel: channel.clone(),
                charset: charset.clone(),
                text,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Charset(#[from] CharsetError),
}

/// Delivers rendered commands, converting text to the channel charset.
pub struct ChatSink {
    chat: Arc<dyn ChatTransport>,
}

impl ChatSink {
    pub fn new(chat: Arc<dyn ChatTransport>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl DeliverySink<ChatCommand> for ChatSink {
    type Error = DeliveryError;

    async fn deliver(&self, command: ChatCommand) -> Result<(), DeliveryError> {
        match command {
            ChatCommand::Join { channel } => {
                debug!(target = "relay", %channel, "joining channel");
                self.chat.join(&channel).await?;
            }
            ChatCommand::Notice {
                channel,
                charset,
                text,
            } => {
                let bytes = charset::encode(&text, charset.as_deref())?;
                trace!(target = "relay", %channel, %text, "sending notice");
                self.chat.notice(&channel, &bytes).await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub board: String,
    pub channel: String,
    pub charset: Option<String>,
    /// Coalescing window for notices from this board.
    pub delay: Duration,
}

struct Route {
    subscription: Subscription,
    client: StreamClient,
    joined: bool,
    board_name: Option<String>,
}

enum RouterEvent {
    Stream {
        board: String,
        event: StreamEvent,
    },
    Subscribed {
        board: String,
        result: Result<Value, StreamError>,
    },
    BoardLoaded {
        board: String,
        result: Result<Board, ApiError>,
    },
}

pub struct Relay {
    api: Arc<dyn BoardApi>,
    dispatch: DispatchHandle<Outbound>,
    gate: watch::Sender<bool>,
    short_link_timeout: Duration,
    routes: HashMap<String, Route>,
    members: HashMap<String, Member>,
    inbox_tx: mpsc::UnboundedSender<RouterEvent>,
    inbox: mpsc::UnboundedReceiver<RouterEvent>,
}

impl Relay {
    /// `gate` is opened while the chat transport is ready.
    pub fn new(
        api: Arc<dyn BoardApi>,
        dispatch: DispatchHandle<Outbound>,
        gate: watch::Sender<bool>,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        Self {
            api,
            dispatch,
            gate,
            short_link_timeout: DEFAULT_SHORT_LINK_TIMEOUT,
            routes: HashMap::new(),
            members: HashMap::new(),
            inbox_tx,
            inbox,
        }
    }

    pub fn with_short_link_timeout(mut self, timeout: Duration) -> Self {
        self.short_link_timeout = timeout;
        self
    }

    /// Routes one board's stream into the relay and starts connecting it.
    pub fn watch(
        &mut self,
        subscription: Subscription,
        client: StreamClient,
        events: StreamEvents,
    ) {
        let board = subscription.board.clone();
        tokio::spawn(forward_stream(board.clone(), events, self.inbox_tx.clone()));
        client.connect();
        info!(target = "relay", %board, channel = %subscription.channel, "watching board");
        self.routes.insert(
            board,
            Route {
                subscription,
                client,
                joined: false,
                board_name: None,
            },
        );
    }

    /// Runs until `shutdown` resolves, then disconnects every stream.
    pub async fn run(
        mut self,
        mut chat_events: mpsc::UnboundedReceiver<ChatEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);
        let mut chat_open = true;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.inbox.recv() => self.handle(event),
                event = chat_events.recv(), if chat_open => match event {
                    Some(ChatEvent::Ready) => {
                        info!(target = "relay", "chat ready; dispatch open");
                        self.gate.send_replace(true);
                    }
                    Some(ChatEvent::Disconnected) => {
                        info!(target = "relay", "chat disconnected; dispatch held");
                        self.gate.send_replace(false);
                    }
                    None => {
                        warn!(target = "relay", "chat transport stopped");
                        self.gate.send_replace(false);
                        chat_open = false;
                    }
                },
            }
        }
        info!(target = "relay", "shutting down");
        for route in self.routes.values() {
            route.client.disconnect();
        }
    }

    fn handle(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Stream { board, event } => match event {
                StreamEvent::Connected => self.subscribe(board),
                StreamEvent::Notify(payload) => self.on_notify(&board, &payload),
                StreamEvent::Closed => {
                    info!(target = "relay", %board, "board stream closed; awaiting reconnect");
                }
            },
            RouterEvent::Subscribed { board, result } => match result {
                Ok(_) => self.on_subscribed(&board),
                Err(err) => {
                    warn!(target = "relay", %board, error = %err, "subscription failed")
                }
            },
            RouterEvent::BoardLoaded { board, result } => match result {
                Ok(loaded) => self.on_board_loaded(&board, loaded),
                Err(err) => {
                    warn!(target = "relay", %board, error = %err, "board lookup failed")
                }
            },
        }
    }

    fn subscribe(&self, board: String) {
        let Some(route) = self.routes.get(&board) else {
            return;
        };
        let client = route.client.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = client.subscribe(&board).await;
            let _ = inbox.send(RouterEvent::Subscribed { board, result });
        });
    }

    fn on_subscribed(&mut self, board: &str) {
        let Some(route) = self.routes.get_mut(board) else {
            return;
        };
        info!(target = "relay", %board, "subscribed");
        if !route.joined {
            route.joined = true;
            let join = Outbound::Join {
                channel: route.subscription.channel.clone(),
            };
            if self.dispatch.enqueue(QueueEntry::now(join)).is_err() {
                warn!(target = "relay", "dispatcher stopped; join dropped");
            }
        }

        let api = self.api.clone();
        let inbox = self.inbox_tx.clone();
        let board = board.to_string();
        tokio::spawn(async move {
            let result = api.board(&board).await;
            let _ = inbox.send(RouterEvent::BoardLoaded { board, result });
        });
    }

    fn on_board_loaded(&mut self, board: &str, loaded: Board) {
        debug!(
            target = "relay",
            %board,
            name = %loaded.name,
            members = loaded.members.len(),
            "board metadata loaded"
        );
        for member in loaded.members {
            self.members.insert(member.id.clone(), member);
        }
        if let Some(route) = self.routes.get_mut(board) {
            route.board_name = Some(loaded.name);
        }
    }

    fn on_notify(&self, stream_board: &str, payload: &Value) {
        match classify(payload) {
            Notification::Actions(actions) => {
                for action in actions {
                    self.on_action(stream_board, &action);
                }
            }
            Notification::Ignored => trace!(target = "relay", "ignoring model update"),
            Notification::Unknown(type_name) => {
                debug!(target = "relay", %type_name, "unknown notification type")
            }
        }
    }

    fn on_action(&self, stream_board: &str, action: &BoardAction) {
        let board = action.board_id().unwrap_or(stream_board);
        let Some(route) = self.routes.get(board) else {
            debug!(target = "relay", %board, "action for unwatched board");
            return;
        };
        let actor = self.actor_name(action);
        let members = &self.members;
        let Some(delta) = action.to_delta(&actor, |id| {
            members.get(id).map(|member| member.username.clone())
        }) else {
            trace!(target = "relay", kind = %action.kind, "action not reported");
            return;
        };

        let subscription = &route.subscription;
        let due = Instant::now() + subscription.delay;
        debug!(
            target = "relay",
            board = route.board_name.as_deref().unwrap_or(board),
            card = %delta.subject_id,
            %actor,
            kind = %action.kind,
            "queueing card change"
        );
        let card = Delta::new(
            delta.subject_id.clone(),
            delta.subject_label.clone(),
            delta.actor_id.clone(),
        );
        let notice = Outbound::Notice {
            channel: subscription.channel.clone(),
            charset: subscription.charset.clone(),
            delta,
        };
        if self.dispatch.enqueue(QueueEntry::at(due, notice)).is_err() {
            warn!(target = "relay", "dispatcher stopped; notice dropped");
            return;
        }
        self.spawn_short_link(subscription, card, due);
    }

    /// Cached username, then the creator embedded in the event, then the
    /// raw member id.
    fn actor_name(&self, action: &BoardAction) -> String {
        let id = action.id_member_creator.as_deref();
        id.and_then(|id| self.members.get(id))
            .map(|member| member.username.clone())
            .or_else(|| {
                action
                    .member_creator
                    .as_ref()
                    .and_then(|creator| creator.username.clone())
            })
            .or_else(|| id.map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Resolves the card link off the router task and enqueues it as a
    /// url-only delta under the same merge key. If the change notice has
    /// already gone out, the url-only delta renders empty and is dropped.
    fn spawn_short_link(&self, subscription: &Subscription, card: Delta, due: Instant) {
        let api = self.api.clone();
        let dispatch = self.dispatch.clone();
        let limit = self.short_link_timeout;
        let channel = subscription.channel.clone();
        let charset = subscription.charset.clone();
        tokio::spawn(async move {
            let url = match time::timeout(limit, api.card_short_link(&card.subject_id)).await {
                Ok(Ok(url)) => url,
                Ok(Err(err)) => {
                    debug!(
                        target = "relay",
                        card = %card.subject_id,
                        error = %err,
                        "short link lookup failed"
                    );
                    return;
                }
                Err(_) => {
                    debug!(
                        target = "relay",
                        card = %card.subject_id,
                        "short link lookup timed out"
                    );
                    return;
                }
            };
            let notice = Outbound::Notice {
                channel,
                charset,
                delta: card.with_url(url),
            };
            let _ = dispatch.enqueue(QueueEntry::at(due, notice));
        });
    }
}

async fn forward_stream(
    board: String,
    mut events: StreamEvents,
    inbox: mpsc::UnboundedSender<RouterEvent>,
) {
    while let Some(event) = events.recv().await {
        let routed = RouterEvent::Stream {
            board: board.clone(),
            event,
        };
        if inbox.send(routed).is_err() {
            break;
        }
    }
}
