//! Forwarding of log messages to Slack.
//!
//! An auxiliary sink, not part of the correctness contract: a
//! `tracing_subscriber` layer matches events against the configured rules
//! (logger prefix, minimum level, target channel) and hands them to a
//! background poster through a bounded queue. When the queue is full,
//! messages are dropped rather than slowing the controller down; on shutdown
//! the queue is drained.

use std::str::FromStr;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Event, Level, Subscriber, debug};
use tracing_subscriber::layer::{Context, Layer};

use crate::errors::Error;

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";
/// Bounded queue length between the layer and the poster.
const QUEUE_LIMIT: usize = 1024;

/// One dispatch rule from the `slack_rules` config key.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlackRule {
    /// Logger (target) prefix the rule applies to, e.g. `coco::engine`.
    pub logger: String,
    /// Minimum level, e.g. `WARNING` or `INFO`.
    pub level: String,
    /// Slack channel the messages go to.
    pub channel: String,
}

struct CompiledRule {
    logger: String,
    level: Level,
    channel: String,
}

#[derive(Debug)]
struct SlackMessage {
    channel: String,
    text: String,
}

/// The `tracing` layer side of the sink.
pub struct SlackLayer {
    rules: Vec<CompiledRule>,
    tx: mpsc::Sender<SlackMessage>,
}

/// Handle on the background poster, used to drain it at shutdown.
pub struct SlackSink {
    task: JoinHandle<()>,
    token: CancellationToken,
}

impl SlackSink {
    /// Compile the rules and start the poster task. Must run inside a tokio
    /// runtime.
    pub fn start(token: String, rules: Vec<SlackRule>) -> Result<(SlackLayer, SlackSink), Error> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let level = parse_level(&rule.level)?;
            compiled.push(CompiledRule {
                logger: rule.logger,
                level,
                channel: rule.channel,
            });
        }

        let (tx, rx) = mpsc::channel(QUEUE_LIMIT);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(post_loop(token, rx, cancel.clone()));
        Ok((
            SlackLayer { rules: compiled, tx },
            SlackSink { task, token: cancel },
        ))
    }

    /// Stop the poster, draining whatever is still queued.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

/// Python-style level names are accepted alongside the tracing ones.
fn parse_level(raw: &str) -> Result<Level, Error> {
    match raw.to_uppercase().as_str() {
        "WARNING" => Ok(Level::WARN),
        "CRITICAL" => Ok(Level::ERROR),
        other => Level::from_str(other)
            .map_err(|_| Error::config(format!("Unknown log level in slack_rules: {raw}"))),
    }
}

async fn post_loop(token: String, mut rx: mpsc::Receiver<SlackMessage>, cancel: CancellationToken) {
    let client = reqwest::Client::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                None => return,
                Some(message) => post(&client, &token, message).await,
            }
        }
    }
    // drain what is already queued, then stop
    while let Ok(message) = rx.try_recv() {
        post(&client, &token, message).await;
    }
}

async fn post(client: &reqwest::Client, token: &str, message: SlackMessage) {
    let outcome = client
        .post(POST_MESSAGE_URL)
        .bearer_auth(token)
        .json(&serde_json::json!({
            "channel": message.channel,
            "text": message.text,
        }))
        .send()
        .await;
    if let Err(e) = outcome {
        // can't log this at a level a rule might match, that would loop
        debug!(target: "coco::slack::poster", "Failed to post to Slack: {e}");
    }
}

impl<S: Subscriber> Layer<S> for SlackLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target().starts_with("coco::slack") {
            return;
        }
        for rule in &self.rules {
            if meta.target().starts_with(&rule.logger) && *meta.level() <= rule.level {
                let mut visitor = MessageVisitor::default();
                event.record(&mut visitor);
                let text = format!("{} {}: {}", meta.level(), meta.target(), visitor.message);
                // drop on full, the controller never waits for Slack
                let _ = self.tx.try_send(SlackMessage {
                    channel: rule.channel.clone(),
                    text,
                });
                break;
            }
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_including_python_names() {
        assert_eq!(parse_level("WARNING").unwrap(), Level::WARN);
        assert_eq!(parse_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_level("ERROR").unwrap(), Level::ERROR);
        assert!(parse_level("LOUD").is_err());
    }

    #[tokio::test]
    async fn matching_events_are_queued_for_posting() {
        let (layer, _sink) = SlackSink::start(
            "xoxb-test".to_string(),
            vec![SlackRule {
                logger: "coco".to_string(),
                level: "WARNING".to_string(),
                channel: "coco-alerts".to_string(),
            }],
        )
        .unwrap();

        // bypass the poster: check the matching logic directly
        assert_eq!(layer.rules.len(), 1);
        assert_eq!(layer.rules[0].level, Level::WARN);
        assert!(Level::ERROR <= layer.rules[0].level);
        assert!(Level::WARN <= layer.rules[0].level);
        assert!(Level::INFO > layer.rules[0].level);
    }
}
