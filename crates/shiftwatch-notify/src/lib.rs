//! Notification fan-out: message composition, the per-recipient dispatcher and outbound transports.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use shiftwatch_core::{strip_link, ChangeCategory, ChangeSet, Recipient};
use shiftwatch_storage::{FetchError, HttpClient};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "shiftwatch-notify";

pub const EMAIL_SUBJECT: &str = "Job Updates";
pub const ALERT_SUBJECT_PREFIX: &str = "Job Checker Error";
pub const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const NEW_EMOJI: &[&str] = &["🎉", "✨", "🌟", "🎊", "🎯"];
const REOPENED_EMOJI: &[&str] = &["🔄", "📢", "🔔", "🎪", "🎭"];
const SPOTFREED_EMOJI: &[&str] = &["🎪", "🎭", "🎨", "🎬"];

pub const CLOSING_QUOTES: &[&str] = &[
    "The show must go on! 🎭",
    "Break a leg! 🎪",
    "Curtain up! 🎬",
    "Lights, camera, action! 🎥",
    "Time to shine! ✨",
    "Your stage awaits! 🎭",
    "Make it count! 🎯",
    "Show time! 🎪",
    "Ready for your close-up! 🎬",
    "Let's make some magic! ✨",
];

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{0} channel is not configured")]
    NotConfigured(Channel),
    #[error("invalid email address {address:?}: {message}")]
    Address { address: String, message: String },
    #[error("building email: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("telegram request failed: {0}")]
    Telegram(String),
    #[error("telegram rejected the message: {0}")]
    TelegramRejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Telegram,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Channel::Email => "email",
            Channel::Telegram => "telegram",
        })
    }
}

/// Outbound delivery for job notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError>;

    async fn send_telegram(&self, chat_id: &str, body: &str) -> Result<(), NotifyError>;
}

/// Channel for cycle-level failures, separate from job notifications.
#[async_trait]
pub trait OperatorAlert: Send + Sync {
    async fn alert(&self, subject: &str, detail: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyAlert;

#[async_trait]
impl OperatorAlert for LogOnlyAlert {
    async fn alert(&self, subject: &str, detail: &str) {
        error!(%subject, %detail, "operator alert");
    }
}

/// Logs the alert and emails it to the operator address.
pub struct EmailOperatorAlert {
    sink: Arc<dyn NotificationSink>,
    to: String,
}

impl EmailOperatorAlert {
    pub fn new(sink: Arc<dyn NotificationSink>, to: impl Into<String>) -> Self {
        Self { sink, to: to.into() }
    }
}

#[async_trait]
impl OperatorAlert for EmailOperatorAlert {
    async fn alert(&self, subject: &str, detail: &str) {
        error!(%subject, %detail, "operator alert");
        let subject = format!("{ALERT_SUBJECT_PREFIX}: {subject}");
        match self.sink.send_email(&self.to, &subject, detail).await {
            Ok(()) => info!(to = %self.to, "operator alert emailed"),
            Err(err) => error!(to = %self.to, error = %err, "failed to email operator alert"),
        }
    }
}

fn header_for(category: ChangeCategory) -> (&'static str, &'static [&'static str]) {
    match category {
        ChangeCategory::New => ("New Jobs Available", NEW_EMOJI),
        ChangeCategory::Reopened => ("Reopened Jobs", REOPENED_EMOJI),
        ChangeCategory::SpotFreed => ("Spots Freed Up", SPOTFREED_EMOJI),
    }
}

/// Build one recipient's message body, or `None` when none of their categories has entries.
pub fn compose_message<R: Rng + ?Sized>(
    changes: &ChangeSet,
    recipient: &Recipient,
    rng: &mut R,
) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for category in ChangeCategory::ALL {
        let messages = changes.messages(category);
        if messages.is_empty() || !recipient.wants(category) {
            continue;
        }
        let (label, emoji) = header_for(category);
        let emoji = emoji.choose(rng).copied().unwrap_or_default();
        parts.push(format!("\n{emoji} {label} {emoji}"));
        parts.extend(messages.iter().map(|message| {
            if recipient.receive_job_links {
                message.clone()
            } else {
                strip_link(message).to_string()
            }
        }));
    }
    if parts.is_empty() {
        return None;
    }
    let quote = CLOSING_QUOTES.choose(rng).copied().unwrap_or_default();
    parts.push(format!("\n\n{quote}"));
    Some(parts.join("\n"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    pub recipient: String,
    pub channel: Channel,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Recipients with at least one successful send.
    pub notified: Vec<String>,
    /// Recipients with no channel or nothing they asked for.
    pub skipped: Vec<String>,
    pub failures: Vec<DeliveryFailure>,
}

impl DispatchReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

struct Delivery<'a> {
    recipient: &'a Recipient,
    body: String,
}

#[derive(Debug, Default)]
struct DeliveryOutcome {
    succeeded: bool,
    attempted: bool,
    failures: Vec<DeliveryFailure>,
}

/// Sends a [`ChangeSet`] to each recipient; delivery failures are logged and reported, never raised.
#[derive(Clone)]
pub struct Dispatcher {
    sink: Arc<dyn NotificationSink>,
    honor_delays: bool,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            honor_delays: true,
        }
    }

    /// Send to every recipient immediately, ignoring their configured delay.
    pub fn skip_delays(mut self) -> Self {
        self.honor_delays = false;
        self
    }

    pub fn sink(&self) -> Arc<dyn NotificationSink> {
        Arc::clone(&self.sink)
    }

    /// Recipients run concurrently so a delay only postpones that recipient's own sends.
    pub async fn dispatch(&self, changes: &ChangeSet, recipients: &[Recipient]) -> DispatchReport {
        info!(recipients = recipients.len(), messages = changes.total(), "dispatching notifications");
        let (deliveries, mut report) = plan_deliveries(changes, recipients);

        let outcomes = join_all(deliveries.into_iter().map(|delivery| {
            let span = info_span!("notify", recipient = %delivery.recipient.email);
            self.deliver(delivery).instrument(span)
        }))
        .await;

        for (email, outcome) in outcomes {
            if outcome.succeeded {
                report.notified.push(email);
            } else if !outcome.attempted {
                report.skipped.push(email);
            }
            report.failures.extend(outcome.failures);
        }
        report
    }

    async fn deliver(&self, delivery: Delivery<'_>) -> (String, DeliveryOutcome) {
        let Delivery { recipient, body } = delivery;
        if self.honor_delays && recipient.delay > 0 {
            info!(minutes = recipient.delay, "delaying notifications");
            tokio::time::sleep(Duration::from_secs(recipient.delay.saturating_mul(60))).await;
        }

        let mut outcome = DeliveryOutcome::default();
        if recipient.use_email {
            outcome.attempted = true;
            let result = self.sink.send_email(&recipient.email, EMAIL_SUBJECT, &body).await;
            outcome.record(recipient, Channel::Email, result);
        }
        if let Some(chat_id) = recipient.telegram_destination() {
            outcome.attempted = true;
            let result = self.sink.send_telegram(chat_id, &body).await;
            outcome.record(recipient, Channel::Telegram, result);
        } else if recipient.use_telegram {
            warn!("telegram enabled without a telegram id");
        }
        (recipient.email.clone(), outcome)
    }
}

impl DeliveryOutcome {
    fn record(&mut self, recipient: &Recipient, channel: Channel, result: Result<(), NotifyError>) {
        match result {
            Ok(()) => {
                info!(%channel, "notification sent");
                self.succeeded = true;
            }
            Err(err) => {
                error!(%channel, error = %err, "notification failed");
                self.failures.push(DeliveryFailure {
                    recipient: recipient.email.clone(),
                    channel,
                    error: err.to_string(),
                });
            }
        }
    }
}

fn plan_deliveries<'a>(
    changes: &ChangeSet,
    recipients: &'a [Recipient],
) -> (Vec<Delivery<'a>>, DispatchReport) {
    let mut rng = rand::thread_rng();
    let mut report = DispatchReport::default();
    let mut deliveries = Vec::new();
    for recipient in recipients {
        if !recipient.has_channel() {
            info!(email = %recipient.email, "skipping recipient with no notification channel");
            report.skipped.push(recipient.email.clone());
            continue;
        }
        match compose_message(changes, recipient, &mut rng) {
            Some(body) => deliveries.push(Delivery { recipient, body }),
            None => {
                info!(email = %recipient.email, "no messages for recipient");
                report.skipped.push(recipient.email.clone());
            }
        }
    }
    (deliveries, report)
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse().map_err(|e: lettre::address::AddressError| NotifyError::Address {
        address: address.to_string(),
        message: e.to_string(),
    })
}

/// SMTP over implicit TLS (port 465) with sender credentials.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(host: &str, sender: &str, password: &str) -> Result<Self, NotifyError> {
        let from = parse_mailbox(sender)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)?
            .credentials(Credentials::new(sender.to_string(), password.to_string()))
            .build();
        Ok(Self { transport, from })
    }

    pub async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(to)?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;
        self.transport.send(message).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Escape text for Telegram's HTML parse mode.
pub fn escape_telegram_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn telegram_rejection(body: &[u8]) -> Result<(), NotifyError> {
    let parsed: TelegramResponse =
        serde_json::from_slice(body).map_err(|e| NotifyError::Telegram(e.to_string()))?;
    if parsed.ok {
        return Ok(());
    }
    let description = parsed.description.unwrap_or_else(|| "Unknown error".to_string());
    let lowered = description.to_lowercase();
    if lowered.contains("chat not found") {
        warn!("telegram chat not found: the user must start the bot first or the chat id is wrong");
    } else if lowered.contains("bot was blocked") {
        warn!("telegram user has blocked the bot");
    }
    Err(NotifyError::TelegramRejected(description))
}

/// Telegram Bot API `sendMessage` client.
#[derive(Debug, Clone)]
pub struct TelegramBot {
    http: HttpClient,
    token: String,
    api_base: String,
}

impl TelegramBot {
    pub fn new(http: HttpClient, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub async fn send(&self, chat_id: &str, body: &str) -> Result<(), NotifyError> {
        // The URL embeds the bot token and must stay out of errors and logs.
        let url = format!("{}/bot{}/sendMessage", self.api_base.trim_end_matches('/'), self.token);
        let text = escape_telegram_html(body);
        let payload = SendMessage {
            chat_id: chat_id.trim(),
            text: &text,
            parse_mode: "HTML",
        };
        match self.http.post_json(&url, &payload).await {
            Ok(response) => telegram_rejection(&response.body),
            Err(FetchError::HttpStatus { status, body, .. }) => {
                match telegram_rejection(body.as_bytes()) {
                    Err(NotifyError::TelegramRejected(description)) => Err(
                        NotifyError::TelegramRejected(format!("{status}: {description}")),
                    ),
                    _ => Err(NotifyError::TelegramRejected(format!("http status {status}"))),
                }
            }
            Err(FetchError::Request(err)) => Err(NotifyError::Telegram(err.without_url().to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub email_sender: Option<String>,
    pub email_password: Option<String>,
    pub smtp_host: String,
    pub telegram_bot_token: Option<String>,
    pub operator_email: Option<String>,
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl TransportConfig {
    pub fn from_env() -> Self {
        Self {
            email_sender: non_empty_env("EMAIL_SENDER"),
            email_password: non_empty_env("EMAIL_PASSWORD"),
            smtp_host: non_empty_env("SMTP_HOST").unwrap_or_else(|| DEFAULT_SMTP_HOST.to_string()),
            telegram_bot_token: non_empty_env("TELEGRAM_BOT_TOKEN"),
            operator_email: non_empty_env("OPERATOR_EMAIL"),
        }
    }
}

/// Real transports; a channel without configuration fails each send with [`NotifyError::NotConfigured`].
#[derive(Default)]
pub struct Transports {
    email: Option<SmtpMailer>,
    telegram: Option<TelegramBot>,
}

impl Transports {
    pub fn from_config(config: &TransportConfig, http: HttpClient) -> Result<Self, NotifyError> {
        let email = match (&config.email_sender, &config.email_password) {
            (Some(sender), Some(password)) => {
                Some(SmtpMailer::new(&config.smtp_host, sender, password)?)
            }
            _ => {
                warn!("EMAIL_SENDER or EMAIL_PASSWORD not set; email disabled");
                None
            }
        };
        let telegram = match &config.telegram_bot_token {
            Some(token) => Some(TelegramBot::new(http, token.clone())),
            None => {
                warn!("TELEGRAM_BOT_TOKEN not set; telegram disabled");
                None
            }
        };
        Ok(Self { email, telegram })
    }
}

#[async_trait]
impl NotificationSink for Transports {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        match &self.email {
            Some(mailer) => mailer.send(to, subject, body).await,
            None => Err(NotifyError::NotConfigured(Channel::Email)),
        }
    }

    async fn send_telegram(&self, chat_id: &str, body: &str) -> Result<(), NotifyError> {
        match &self.telegram {
            Some(bot) => bot.send(chat_id, body).await,
            None => Err(NotifyError::NotConfigured(Channel::Telegram)),
        }
    }
}

/// Operator alerts go by email when an operator address is configured, otherwise to the log only.
pub fn operator_alert(
    config: &TransportConfig,
    sink: Arc<dyn NotificationSink>,
) -> Arc<dyn OperatorAlert> {
    match &config.operator_email {
        Some(to) => Arc::new(EmailOperatorAlert::new(sink, to.clone())),
        None => Arc::new(LogOnlyAlert),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel: Channel,
    pub destination: String,
    pub subject: Option<String>,
    pub body: String,
    pub sent_at: tokio::time::Instant,
}

/// Keeps every message in memory instead of sending it. Backs dry runs.
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, message: SentMessage) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(message);
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        self.push(SentMessage {
            channel: Channel::Email,
            destination: to.to_string(),
            subject: Some(subject.to_string()),
            body: body.to_string(),
            sent_at: tokio::time::Instant::now(),
        });
        Ok(())
    }

    async fn send_telegram(&self, chat_id: &str, body: &str) -> Result<(), NotifyError> {
        self.push(SentMessage {
            channel: Channel::Telegram,
            destination: chat_id.to_string(),
            subject: None,
            body: body.to_string(),
            sent_at: tokio::time::Instant::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn changes() -> ChangeSet {
        ChangeSet {
            new: vec!["New shift/job: A\nLink: https://example.test/a".to_string()],
            reopened: vec![],
            spotfreed: vec!["Spot freed: B (was 5/5, now 4/5)".to_string()],
        }
    }

    struct FailingTelegram(RecordingSink);

    #[async_trait]
    impl NotificationSink for FailingTelegram {
        async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
            self.0.send_email(to, subject, body).await
        }

        async fn send_telegram(&self, _chat_id: &str, _body: &str) -> Result<(), NotifyError> {
            Err(NotifyError::TelegramRejected("Bad Request: chat not found".into()))
        }
    }

    #[test]
    fn message_has_headers_in_category_order_and_a_closing_quote() {
        let mut rng = StdRng::seed_from_u64(7);
        let body = compose_message(&changes(), &Recipient::new("a@x.test"), &mut rng).unwrap();
        let new_at = body.find("New Jobs Available").unwrap();
        let freed_at = body.find("Spots Freed Up").unwrap();
        assert!(new_at < freed_at);
        assert!(!body.contains("Reopened Jobs"));
        assert!(body.contains("Link: https://example.test/a"));
        assert!(CLOSING_QUOTES.iter().any(|q| body.ends_with(&format!("\n\n{q}"))));
    }

    #[test]
    fn links_are_stripped_when_recipient_opts_out() {
        let mut recipient = Recipient::new("a@x.test");
        recipient.receive_job_links = false;
        let body = compose_message(&changes(), &recipient, &mut StdRng::seed_from_u64(1)).unwrap();
        assert!(body.contains("New shift/job: A"));
        assert!(!body.contains("Link:"));
    }

    #[test]
    fn nothing_to_send_when_categories_disabled() {
        let mut recipient = Recipient::new("a@x.test");
        recipient.notify_new = false;
        recipient.notify_spotfreed = false;
        assert!(compose_message(&changes(), &recipient, &mut StdRng::seed_from_u64(1)).is_none());
    }

    #[test]
    fn telegram_html_is_escaped() {
        assert_eq!(escape_telegram_html("a <b> & c"), "a &lt;b&gt; &amp; c");
    }

    #[test]
    fn telegram_response_requires_ok_flag() {
        assert!(telegram_rejection(br#"{"ok":true,"result":{}}"#).is_ok());
        let err = telegram_rejection(br#"{"ok":false,"description":"Forbidden: bot was blocked by the user"}"#)
            .unwrap_err();
        assert!(matches!(err, NotifyError::TelegramRejected(d) if d.contains("blocked")));
    }

    #[tokio::test(start_paused = true)]
    async fn delays_apply_per_recipient() {
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = Dispatcher::new(sink.clone());
        let mut slow = Recipient::new("slow@x.test");
        slow.delay = 2;
        let mut medium = Recipient::new("medium@x.test");
        medium.delay = 1;
        let fast = Recipient::new("fast@x.test");

        let start = tokio::time::Instant::now();
        let report = dispatcher.dispatch(&changes(), &[slow, medium, fast]).await;
        assert_eq!(report.notified.len(), 3);

        let offsets: Vec<(String, u64)> = sink
            .sent()
            .into_iter()
            .map(|m| (m.destination, (m.sent_at - start).as_secs()))
            .collect();
        assert_eq!(
            offsets,
            vec![
                ("fast@x.test".to_string(), 0),
                ("medium@x.test".to_string(), 60),
                ("slow@x.test".to_string(), 120),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn skipping_delays_sends_at_once() {
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = Dispatcher::new(sink.clone()).skip_delays();
        let mut slow = Recipient::new("slow@x.test");
        slow.delay = 30;

        let start = tokio::time::Instant::now();
        dispatcher.dispatch(&changes(), &[slow]).await;
        assert_eq!((sink.sent()[0].sent_at - start).as_secs(), 0);
    }

    #[tokio::test]
    async fn failures_and_skips_are_reported_not_raised() {
        let sink = Arc::new(FailingTelegram(RecordingSink::new()));
        let dispatcher = Dispatcher::new(sink.clone());

        let mut both = Recipient::new("both@x.test");
        both.use_telegram = true;
        both.telegram_id = "42".into();
        let mut silent = Recipient::new("silent@x.test");
        silent.use_email = false;
        let mut uninterested = Recipient::new("none@x.test");
        uninterested.notify_new = false;
        uninterested.notify_spotfreed = false;

        let report = dispatcher.dispatch(&changes(), &[both, silent, uninterested]).await;
        assert_eq!(report.notified, vec!["both@x.test".to_string()]);
        assert_eq!(report.skipped, vec!["silent@x.test".to_string(), "none@x.test".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].channel, Channel::Telegram);
        assert_eq!(sink.0.sent().len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_transports_fail_each_send() {
        let transports = Transports::default();
        let err = transports.send_email("a@x.test", "s", "b").await.unwrap_err();
        assert!(matches!(err, NotifyError::NotConfigured(Channel::Email)));
    }
}
