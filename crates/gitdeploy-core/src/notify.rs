//! Run reporting: sanitized transcript to sinks, outcome callbacks to extensions.
//!
//! Every invocation ends in [`Notifier::report`], whatever its outcome. Sink and
//! extension failures are logged and recorded but never change the outcome.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{DeployConfig, ExtensionConfig, ExtensionKind};
use crate::domain::{DeployError, Result};
use crate::transcript::RunOutput;

/// Passed to [`DeployExtension::on_success`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuccessMetadata {
    pub remote: String,
    pub branch: String,
    pub target_directory: PathBuf,
    pub commit: String,
    pub elapsed_seconds: f64,
}

/// What extensions should hear about a finished run.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Success(SuccessMetadata),
    Failure(String),
    /// No callback (no-ops, runs already in progress).
    Quiet,
}

impl Notice {
    fn subject(&self) -> &'static str {
        match self {
            Notice::Success(_) => "deployment succeeded",
            Notice::Failure(_) => "deployment failed",
            Notice::Quiet => "deployment report",
        }
    }
}

/// Request identity printed in the report header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportHeader {
    pub caller_address: String,
    pub branch: String,
    pub commit: String,
}

// ── Sanitizing ────────────────────────────────────────────────────────────

fn block_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(head|script|style)\b.*?</(head|script|style)\s*>")
            .expect("static regex")
    })
}

fn tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"</?[A-Za-z!][^<>]*>").expect("static regex"))
}

fn blank_run_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n(?:[ \t]*\n){2,}").expect("static regex"))
}

/// Strip markup and collapse blank-line runs.
///
/// `<head>`, `<script>` and `<style>` blocks go with their content; other tags
/// are removed; basic HTML entities are decoded.
pub fn sanitize(text: &str) -> String {
    let text = block_pattern().replace_all(text, "");
    let text = tag_pattern().replace_all(&text, "");
    let text = decode_entities(&text);
    blank_run_pattern().replace_all(&text, "\n\n").into_owned()
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Report text: a rule, the header line, then the sanitized transcript.
pub fn compose(out: &RunOutput, header: &ReportHeader) -> String {
    format!(
        "{}\n[{}] - {} - b={} c={}\n{}",
        "~".repeat(80),
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        header.caller_address,
        header.branch,
        header.commit,
        sanitize(&out.render()).trim_start_matches('\n')
    )
}

// ── Sinks ─────────────────────────────────────────────────────────────────

/// Destination for the composed report.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, subject: &str, report: &str) -> Result<()>;
}

/// Appends reports to a log file.
#[derive(Debug, Clone)]
pub struct LogFileSink {
    path: PathBuf,
}

impl LogFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NotificationSink for LogFileSink {
    fn name(&self) -> &str {
        "log_file"
    }

    async fn deliver(&self, _subject: &str, report: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(report.as_bytes()).await?;
        if !report.ends_with('\n') {
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Mails reports through a sendmail-compatible command reading the message
/// on stdin.
#[derive(Debug, Clone)]
pub struct EmailSink {
    to: String,
    command: String,
    time_limit: Duration,
}

impl EmailSink {
    pub fn new(to: impl Into<String>, command: impl Into<String>, time_limit: Duration) -> Self {
        Self {
            to: to.into(),
            command: command.into(),
            time_limit,
        }
    }

    /// RFC 5322 message handed to the mailer.
    pub fn message(&self, subject: &str, report: &str) -> String {
        format!(
            "To: {}\nSubject: [gitdeploy] {subject}\nContent-Type: text/plain; charset=utf-8\n\n{report}\n",
            self.to
        )
    }
}

#[async_trait]
impl NotificationSink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, subject: &str, report: &str) -> Result<()> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            DeployError::Configuration(vec!["sendmail_command is empty".to_string()])
        })?;
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DeployError::Environment {
                    tool: program.to_string(),
                },
                _ => DeployError::Io(e),
            })?;

        let message = self.message(subject, report);
        let mut stdin = child.stdin.take();
        let send = async {
            if let Some(pipe) = stdin.as_mut() {
                pipe.write_all(message.as_bytes()).await?;
            }
            // Close stdin so the mailer sees end of message.
            drop(stdin.take());
            child.wait().await
        };
        let status = match tokio::time::timeout(self.time_limit, send).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(command = %self.command, error = %e, "failed to kill mailer");
                }
                return Err(DeployError::Timeout {
                    command: self.command.clone(),
                    limit_secs: self.time_limit.as_secs(),
                    partial_output: String::new(),
                });
            }
        };
        if !status.success() {
            return Err(DeployError::CommandFailed {
                command: self.command.clone(),
                exit_code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

// ── Extensions ────────────────────────────────────────────────────────────

/// Outcome callbacks. Errors are plain messages and never abort anything.
#[async_trait]
pub trait DeployExtension: Send + Sync {
    fn name(&self) -> &str;
    async fn on_success(&self, metadata: &SuccessMetadata) -> std::result::Result<(), String>;
    async fn on_failure(&self, message: &str) -> std::result::Result<(), String>;
}

/// POSTs a JSON notification to a URL.
pub struct HttpExtension {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpExtension {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .user_agent(concat!("gitdeploy/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| {
                DeployError::Configuration(vec![format!("extension '{name}': {e}")])
            })?;
        Ok(Self {
            name,
            url: url.into(),
            client,
        })
    }

    async fn post(&self, body: serde_json::Value) -> std::result::Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        response
            .error_for_status()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl DeployExtension for HttpExtension {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_success(&self, metadata: &SuccessMetadata) -> std::result::Result<(), String> {
        let mut body = serde_json::to_value(metadata).map_err(|e| e.to_string())?;
        if let Some(map) = body.as_object_mut() {
            map.insert("event".to_string(), json!("success"));
        }
        self.post(body).await
    }

    async fn on_failure(&self, message: &str) -> std::result::Result<(), String> {
        self.post(json!({ "event": "failure", "message": message }))
            .await
    }
}

/// Extensions resolved at startup, called in registration order.
#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    extensions: Vec<Arc<dyn DeployExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(entries: &[ExtensionConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for entry in entries {
            match &entry.kind {
                ExtensionKind::Http { url, timeout_secs } => {
                    registry.register(Arc::new(HttpExtension::new(
                        &entry.name,
                        url,
                        Duration::from_secs(*timeout_secs),
                    )?));
                }
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, extension: Arc<dyn DeployExtension>) {
        self.extensions.push(extension);
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.extensions.iter().map(|e| e.name()).collect()
    }

    /// Deliver `notice` to every extension concurrently; results in
    /// registration order.
    pub async fn dispatch(&self, notice: &Notice) -> Vec<(String, std::result::Result<(), String>)> {
        let calls = self.extensions.iter().map(|ext| async move {
            let result = match notice {
                Notice::Success(metadata) => ext.on_success(metadata).await,
                Notice::Failure(message) => ext.on_failure(message).await,
                Notice::Quiet => Ok(()),
            };
            (ext.name().to_string(), result)
        });
        join_all(calls).await
    }
}

// ── Notifier ──────────────────────────────────────────────────────────────

/// Fans a finished run out to extensions and sinks.
#[derive(Default)]
pub struct Notifier {
    sinks: Vec<Box<dyn NotificationSink>>,
    extensions: ExtensionRegistry,
}

impl Notifier {
    pub fn new(extensions: ExtensionRegistry) -> Self {
        Self {
            sinks: Vec::new(),
            extensions,
        }
    }

    /// Sinks and extensions named by `config`.
    pub fn from_config(config: &DeployConfig) -> Result<Self> {
        let mut notifier = Self::new(ExtensionRegistry::from_config(&config.extensions)?);
        if let Some(path) = &config.log_file {
            notifier.add_sink(Box::new(LogFileSink::new(path)));
        }
        if let Some(to) = config.email_notifications.as_deref().filter(|s| !s.is_empty()) {
            notifier.add_sink(Box::new(EmailSink::new(
                to,
                &config.sendmail_command,
                config.time_limit(),
            )));
        }
        Ok(notifier)
    }

    pub fn add_sink(&mut self, sink: Box<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    /// Run extension callbacks, record their results in `out`, then deliver
    /// the composed report to every sink. Returns the report.
    pub async fn report(&self, out: &mut RunOutput, notice: &Notice, header: &ReportHeader) -> String {
        if !matches!(notice, Notice::Quiet) {
            for (name, result) in self.extensions.dispatch(notice).await {
                match result {
                    Ok(()) => out.note(format!("[extension: {name}] callback delivered")),
                    Err(reason) => {
                        warn!(extension = %name, error = %reason, "extension callback failed");
                        out.error(format!("extension '{name}' returned: {reason}"));
                    }
                }
            }
        }

        let report = compose(out, header);
        for sink in &self.sinks {
            match sink.deliver(notice.subject(), &report).await {
                Ok(()) => debug!(sink = sink.name(), "report delivered"),
                Err(e) => warn!(sink = sink.name(), error = %e, "report delivery failed"),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_sanitize_strips_markup() {
        let html = "<html><head><title>x</title></head><body>\n<pre>\n\
                    <script>alert(1)</script><style>p{}</style>\
                    <span class=\"prompt\">$</span> git &amp; rsync &lt;ok&gt;\n\n\n\n\nDone.\n</pre>";
        let text = sanitize(html);
        assert!(!text.contains("title"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("p{}"));
        assert!(text.contains("$ git & rsync <ok>"));
        assert!(!text.contains("\n\n\n"));
        assert!(text.contains("Done."));
    }

    #[test]
    fn test_compose_header() {
        let mut out = RunOutput::new("r");
        out.note("hello");
        let header = ReportHeader {
            caller_address: "10.0.0.1".to_string(),
            branch: "main".to_string(),
            commit: String::new(),
        };
        let report = compose(&out, &header);
        let mut lines = report.lines();
        assert_eq!(lines.next().unwrap(), "~".repeat(80));
        let line = lines.next().unwrap();
        assert!(line.starts_with('['));
        assert!(line.ends_with("] - 10.0.0.1 - b=main c="));
        assert!(report.contains("hello"));
    }

    struct Probe {
        name: String,
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DeployExtension for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_success(&self, metadata: &SuccessMetadata) -> std::result::Result<(), String> {
            self.calls.lock().unwrap().push(format!("success {}", metadata.commit));
            if self.fail {
                Err("boom".to_string())
            } else {
                Ok(())
            }
        }

        async fn on_failure(&self, message: &str) -> std::result::Result<(), String> {
            self.calls.lock().unwrap().push(format!("failure {message}"));
            Ok(())
        }
    }

    fn metadata() -> SuccessMetadata {
        SuccessMetadata {
            remote: "git@example.com:site.git".to_string(),
            branch: "main".to_string(),
            target_directory: PathBuf::from("/srv/www"),
            commit: "abc123".to_string(),
            elapsed_seconds: 1.5,
        }
    }

    #[tokio::test]
    async fn test_extension_results_are_recorded_and_sinks_receive_them() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ExtensionRegistry::new();
        registry.register(Arc::new(Probe {
            name: "ok".to_string(),
            fail: false,
            calls: calls.clone(),
        }));
        registry.register(Arc::new(Probe {
            name: "broken".to_string(),
            fail: true,
            calls: calls.clone(),
        }));

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/deploy.log");
        let mut notifier = Notifier::new(registry);
        notifier.add_sink(Box::new(LogFileSink::new(&log)));

        let mut out = RunOutput::new("r");
        let report = notifier
            .report(&mut out, &Notice::Success(metadata()), &ReportHeader::default())
            .await;

        assert_eq!(calls.lock().unwrap().len(), 2);
        assert!(report.contains("[extension: ok] callback delivered"));
        assert!(report.contains("ERR! extension 'broken' returned: boom"));
        let logged = std::fs::read_to_string(&log).unwrap();
        assert!(logged.contains("extension 'broken'"));

        notifier
            .report(&mut RunOutput::new("r2"), &Notice::Quiet, &ReportHeader::default())
            .await;
        assert_eq!(calls.lock().unwrap().len(), 2);
        let logged = std::fs::read_to_string(&log).unwrap();
        assert_eq!(logged.matches(&"~".repeat(80)).count(), 2);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let mut notifier = Notifier::default();
        // A directory cannot be opened for appending.
        notifier.add_sink(Box::new(LogFileSink::new(dir.path())));
        let report = notifier
            .report(
                &mut RunOutput::new("r"),
                &Notice::Failure("x".to_string()),
                &ReportHeader::default(),
            )
            .await;
        assert!(report.starts_with('~'));
    }

    #[tokio::test]
    async fn test_email_sink_pipes_message_to_command() {
        let dir = tempfile::tempdir().unwrap();
        let captured = dir.path().join("mail.txt");
        let script = dir.path().join("fake-sendmail.sh");
        std::fs::write(&script, format!("#!/bin/sh\ncat > {}\n", captured.display())).unwrap();

        let sink = EmailSink::new(
            "ops@example.com",
            format!("sh {}", script.display()),
            Duration::from_secs(10),
        );
        sink.deliver("deployment failed", "body text").await.unwrap();

        let mail = std::fs::read_to_string(&captured).unwrap();
        assert!(mail.starts_with("To: ops@example.com\n"));
        assert!(mail.contains("Subject: [gitdeploy] deployment failed"));
        assert!(mail.contains("\n\nbody text"));
    }

    #[tokio::test]
    async fn test_email_sink_times_out_when_mailer_ignores_stdin() {
        let sink = EmailSink::new(
            "ops@example.com",
            "sleep 30",
            Duration::from_millis(300),
        );
        // Larger than a pipe buffer, so the write itself blocks.
        let report = "x".repeat(512 * 1024);
        let started = std::time::Instant::now();
        let err = sink.deliver("stuck", &report).await.unwrap_err();
        assert!(matches!(err, DeployError::Timeout { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_registry_from_config() {
        let entries = vec![ExtensionConfig {
            name: "chatops".to_string(),
            kind: ExtensionKind::Http {
                url: "https://hooks.example.com/deploy".to_string(),
                timeout_secs: 5,
            },
        }];
        let registry = ExtensionRegistry::from_config(&entries).unwrap();
        assert_eq!(registry.names(), vec!["chatops"]);
    }
}
