use std::sync::Arc;

use async_trait::async_trait;
use board_stream::Backoff;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{ChatError, ChatEvent, ChatTransport};

#[derive(Debug, Clone)]
pub struct IrcConfig {
    pub host: String,
    pub port: u16,
    pub nick: String,
    pub password: Option<String>,
    pub username: String,
    pub realname: String,
    pub backoff: Backoff,
}

impl IrcConfig {
    pub fn new(host: impl Into<String>, port: u16, nick: impl Into<String>) -> Self {
        let nick = nick.into();
        Self {
            host: host.into(),
            port,
            username: nick.clone(),
            realname: nick.clone(),
            nick,
            password: None,
            backoff: Backoff::default(),
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn registration(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(3);
        if let Some(password) = &self.password {
            lines.push(format!("PASS {password}"));
        }
        lines.push(format!("NICK {}", self.nick));
        lines.push(format!("USER {} 0 * :{}", self.username, self.realname));
        lines
    }
}

/// One parsed server line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn parse(line: &str) -> Option<Message> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        let prefix = match rest.strip_prefix(':') {
            Some(stripped) => {
                let (prefix, tail) = stripped.split_once(' ')?;
                rest = tail;
                Some(prefix.to_string())
            }
            None => None,
        };
        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };
        let mut words = head.split(' ').filter(|word| !word.is_empty());
        let command = words.next()?.to_ascii_uppercase();
        let mut params: Vec<String> = words.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            params.push(trailing.to_string());
        }
        Some(Message {
            prefix,
            command,
            params,
        })
    }
}

/// `NOTICE` line with embedded line breaks flattened.
fn notice_line(channel: &str, text: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(channel.len() + text.len() + 12);
    line.extend_from_slice(b"NOTICE ");
    line.extend_from_slice(channel.as_bytes());
    line.extend_from_slice(b" :");
    line.extend(
        text.iter()
            .map(|byte| if matches!(byte, b'\r' | b'\n') { b' ' } else { *byte }),
    );
    line.extend_from_slice(b"\r\n");
    line
}

fn command_line(line: &str) -> Vec<u8> {
    format!("{line}\r\n").into_bytes()
}

/// IRC connection that stays up across server drops.
///
/// Joined channels are remembered and rejoined after every reconnect.
/// Commands issued while unregistered wait until registration completes.
#[derive(Clone)]
pub struct IrcClient {
    commands: mpsc::UnboundedSender<Vec<u8>>,
    channels: Arc<Mutex<Vec<String>>>,
}

impl IrcClient {
    pub fn spawn(config: IrcConfig) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channels = Arc::new(Mutex::new(Vec::new()));
        let driver = Driver {
            config,
            commands: commands_rx,
            channels: channels.clone(),
            events: events_tx,
        };
        tokio::spawn(driver.run());
        (
            Self {
                commands: commands_tx,
                channels,
            },
            events_rx,
        )
    }

    fn send(&self, line: Vec<u8>) -> Result<(), ChatError> {
        self.commands.send(line).map_err(|_| ChatError::Closed)
    }
}

#[async_trait]
impl ChatTransport for IrcClient {
    async fn join(&self, channel: &str) -> Result<(), ChatError> {
        {
            let mut channels = self.channels.lock();
            if !channels.iter().any(|known| known.eq_ignore_ascii_case(channel)) {
                channels.push(channel.to_string());
            }
        }
        self.send(command_line(&format!("JOIN {channel}")))
    }

    async fn notice(&self, channel: &str, text: &[u8]) -> Result<(), ChatError> {
        self.send(notice_line(channel, text))
    }
}

enum SessionEnd {
    Lost(String),
    ClientGone,
}

struct Driver {
    config: IrcConfig,
    commands: mpsc::UnboundedReceiver<Vec<u8>>,
    channels: Arc<Mutex<Vec<String>>>,
    events: mpsc::UnboundedSender<ChatEvent>,
}

impl Driver {
    async fn run(mut self) {
        let mut backoff = self.config.backoff.clone();
        loop {
            let addr = (self.config.host.clone(), self.config.port);
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    info!(
                        target = "irc",
                        host = %self.config.host,
                        port = self.config.port,
                        "irc connected"
                    );
                    match self.session(stream, &mut backoff).await {
                        SessionEnd::ClientGone => {
                            debug!(target = "irc", "irc client dropped; closing connection");
                            return;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!(target = "irc", %reason, "irc connection lost")
                        }
                    }
                }
                Err(err) => warn!(
                    target = "irc",
                    host = %self.config.host,
                    error = %err,
                    "irc connect failed"
                ),
            }
            let delay = backoff.next_delay();
            debug!(
                target = "irc",
                ?delay,
                attempt = backoff.attempt(),
                "irc reconnect scheduled"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn session(&mut self, stream: TcpStream, backoff: &mut Backoff) -> SessionEnd {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut nick = self.config.nick.clone();
        let mut registered = false;
        let mut buf = Vec::new();

        for line in self.config.registration() {
            if let Err(err) = write_all(&mut write, &command_line(&line)).await {
                return SessionEnd::Lost(err);
            }
        }

        let end = loop {
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => {
                    match read {
                        Ok(0) => break SessionEnd::Lost("closed by server".into()),
                        Err(err) => break SessionEnd::Lost(err.to_string()),
                        Ok(_) => {}
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();
                    let Some(message) = Message::parse(&line) else {
                        continue;
                    };
                    trace!(target = "irc", command = %message.command, "irc <-");
                    let reply = match message.command.as_str() {
                        "PING" => Some(match message.params.last() {
                            Some(token) => format!("PONG :{token}"),
                            None => "PONG".to_string(),
                        }),
                        "376" | "422" if !registered => {
                            registered = true;
                            backoff.reset();
                            info!(target = "irc", %nick, "irc registered");
                            if let Err(err) = self.rejoin(&mut write).await {
                                break SessionEnd::Lost(err);
                            }
                            let _ = self.events.send(ChatEvent::Ready);
                            None
                        }
                        "433" if !registered => {
                            nick.push('_');
                            debug!(target = "irc", %nick, "nick in use; retrying");
                            Some(format!("NICK {nick}"))
                        }
                        "ERROR" => {
                            break SessionEnd::Lost(message.params.join(" "));
                        }
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        if let Err(err) = write_all(&mut write, &command_line(&reply)).await {
                            break SessionEnd::Lost(err);
                        }
                    }
                }
                command = self.commands.recv(), if registered => {
                    let Some(command) = command else {
                        let _ = write_all(&mut write, &command_line("QUIT")).await;
                        break SessionEnd::ClientGone;
                    };
                    if let Err(err) = write_all(&mut write, &command).await {
                        break SessionEnd::Lost(err);
                    }
                }
            }
        };

        if registered {
            let _ = self.events.send(ChatEvent::Disconnected);
        }
        end
    }

    async fn rejoin(&self, write: &mut OwnedWriteHalf) -> Result<(), String> {
        let channels = self.channels.lock().clone();
        for channel in channels {
            write_all(write, &command_line(&format!("JOIN {channel}"))).await?;
        }
        Ok(())
    }
}

async fn write_all(write: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<(), String> {
    write.write_all(bytes).await.map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn parses_prefix_params_and_trailing() {
        let message = Message::parse(":irc.example.net 001 relay :Welcome to IRC\r\n").unwrap();
        assert_eq!(message.prefix.as_deref(), Some("irc.example.net"));
        assert_eq!(message.command, "001");
        assert_eq!(message.params, vec!["relay", "Welcome to IRC"]);

        let ping = Message::parse("PING :abc123").unwrap();
        assert_eq!(ping.prefix, None);
        assert_eq!(ping.params, vec!["abc123"]);

        assert!(Message::parse("").is_none());
        assert!(Message::parse(":only-prefix").is_none());
    }

    #[test]
    fn notice_flattens_line_breaks() {
        assert_eq!(
            notice_line("#team", b"one\r\ntwo"),
            b"NOTICE #team :one  two\r\n".to_vec()
        );
    }

    #[test]
    fn registration_sends_password_first() {
        let config = IrcConfig::new("irc.example.net", 6667, "relay")
            .with_password(Some("secret".into()));
        assert_eq!(
            config.registration(),
            vec!["PASS secret", "NICK relay", "USER relay 0 * :relay"]
        );
        let open = IrcConfig::new("irc.example.net", 6667, "relay");
        assert_eq!(open.registration()[0], "NICK relay");
    }

    struct Server {
        lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    impl Server {
        async fn expect(&mut self, want: &str) {
            loop {
                let line = timeout(WAIT, self.lines.next_line())
                    .await
                    .expect("timed out")
                    .unwrap()
                    .expect("client hung up");
                if line == want {
                    return;
                }
            }
        }

        async fn say(&mut self, line: &str) {
            self.write
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }
    }

    async fn accept(listener: &TcpListener) -> Server {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (read, write) = stream.into_split();
        Server {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn start() -> (TcpListener, IrcClient, mpsc::UnboundedReceiver<ChatEvent>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = IrcConfig::new("127.0.0.1", port, "relay").with_backoff(
            Backoff::new(Duration::from_millis(10), Duration::from_millis(20)).without_jitter(),
        );
        let (client, events) = IrcClient::spawn(config);
        (listener, client, events)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ChatEvent>) -> ChatEvent {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn registers_answers_pings_and_sends_notices() {
        let (listener, client, mut events) = start().await;
        let mut server = accept(&listener).await;

        server.expect("USER relay 0 * :relay").await;
        server.say(":srv 433 * relay :Nickname is already in use").await;
        server.expect("NICK relay_").await;
        server.say(":srv 376 relay_ :End of MOTD").await;
        assert_eq!(next_event(&mut events).await, ChatEvent::Ready);

        server.say("PING :token-1").await;
        server.expect("PONG :token-1").await;

        client.join("#team").await.unwrap();
        client.notice("#team", "héllo".as_bytes()).await.unwrap();
        server.expect("JOIN #team").await;
        server.expect("NOTICE #team :héllo").await;
    }

    #[tokio::test]
    async fn rejoins_channels_after_reconnect() {
        let (listener, client, mut events) = start().await;
        let mut server = accept(&listener).await;
        server.say(":srv 422 relay :MOTD File is missing").await;
        assert_eq!(next_event(&mut events).await, ChatEvent::Ready);
        client.join("#team").await.unwrap();
        server.expect("JOIN #team").await;

        drop(server);
        assert_eq!(next_event(&mut events).await, ChatEvent::Disconnected);

        let mut server = accept(&listener).await;
        server.expect("NICK relay").await;
        server.say(":srv 376 relay :End of MOTD").await;
        server.expect("JOIN #team").await;
        assert_eq!(next_event(&mut events).await, ChatEvent::Ready);
    }

    #[tokio::test]
    async fn commands_wait_for_registration() {
        let (listener, client, mut events) = start().await;
        client.notice("#team", b"early").await.unwrap();
        let mut server = accept(&listener).await;
        server.expect("USER relay 0 * :relay").await;
        server.say(":srv 376 relay :End of MOTD").await;
        assert_eq!(next_event(&mut events).await, ChatEvent::Ready);
        server.expect("NOTICE #team :early").await;
    }
}
