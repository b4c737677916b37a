//! Console transport and echo back end for running courier from a terminal.

use std::time::Duration;

use {
    async_trait::async_trait,
    courier_auto_reply::ReplyGenerator,
    courier_channels::{ChannelOutbound, Error as ChannelError},
    courier_common::{Envelope, EnvelopeKind, Reply, ReplyContent, types::attr},
    courier_dispatch::Dispatcher,
    tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

pub const CONSOLE_ID: &str = "console";

/// Typing this cancels the console session instead of being submitted.
const CANCEL_COMMAND: &str = "#cancel";

/// Writes replies to stdout, one line per segment.
pub struct ConsoleOutbound;

#[async_trait]
impl ChannelOutbound for ConsoleOutbound {
    fn id(&self) -> &str {
        CONSOLE_ID
    }

    async fn send(&self, to: &str, reply: &Reply, _envelope: &Envelope) -> anyhow::Result<()> {
        let body = match &reply.content {
            ReplyContent::Text(text) => text.clone(),
            ReplyContent::Url(url) => url.clone(),
            ReplyContent::Path(path) => path.display().to_string(),
            ReplyContent::Binary(bytes) => format!("<{} bytes of {}>", bytes.len(), reply.kind),
            ReplyContent::Structured(value) => value.to_string(),
        };
        let line = format!("[{to}] {body}\n");
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ChannelError::external("writing reply to stdout", e))?;
        stdout
            .flush()
            .await
            .map_err(|e| ChannelError::external("flushing stdout", e))?;
        Ok(())
    }
}

/// Replies with the envelope's own text, optionally after a delay so that
/// cancellation can be tried by hand.
pub struct EchoGenerator {
    delay: Duration,
}

impl EchoGenerator {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ReplyGenerator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    fn kinds(&self) -> &[EnvelopeKind] {
        &[EnvelopeKind::Text]
    }

    async fn generate(&self, envelope: &Envelope) -> anyhow::Result<Option<Reply>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(envelope.text_payload().map(Reply::text))
    }
}

/// Build the envelope for one typed line.
pub fn line_envelope(line: &str) -> Envelope {
    Envelope::text(line)
        .with_attribute(attr::SESSION_ID, CONSOLE_ID)
        .with_attribute(attr::RECEIVER, CONSOLE_ID)
        .with_attribute(attr::SENDER_ID, CONSOLE_ID)
        .with_attribute(attr::CHANNEL, CONSOLE_ID)
}

/// Feed stdin lines to the dispatcher until EOF or `stop` fires.
pub async fn read_stdin(dispatcher: &Dispatcher, stop: CancellationToken) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            () = stop.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("stdin closed");
            return Ok(());
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == CANCEL_COMMAND {
            let report = dispatcher.cancel_session(CONSOLE_ID);
            info!(
                discarded = report.discarded,
                signalled = report.signalled,
                "console session cancelled"
            );
            continue;
        }

        let envelope = line_envelope(line);
        debug!(envelope_id = %envelope.id(), "console line submitted");
        if let Err(e) = dispatcher.submit(envelope) {
            warn!(error = %e, "console line rejected");
            return Ok(());
        }
    }
}
