//! The handler pipeline: predicate, event-kind filter, child process,
//! webhook fanout.
//!
//! The pipeline returns the first error it hits; retry policy lives in the
//! engine worker, not here.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use manta_core::expr::Template;
use manta_core::{EventKind, Object};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use url::Url;

use crate::engine::Handler;
use crate::reaper;

#[derive(Clone)]
pub struct PipelineConfig {
    /// Used as the stderr log prefix for the child process.
    pub name: String,
    pub events: HashSet<EventKind>,
    /// Skip the event when this renders empty, errors, or yields `<no value>`.
    pub when: Option<Template>,
    pub command: Vec<String>,
    pub pass_stdin: bool,
    pub pass_env: bool,
    pub pass_args: bool,
    pub max_retries: i64,
    pub webhooks: Vec<Url>,
    pub webhook_timeout: Duration,
    pub webhook_payload: bool,
    pub webhook_params: Vec<(String, Template)>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "event".to_string(),
            events: HashSet::from([EventKind::Add, EventKind::Update, EventKind::Delete]),
            when: None,
            command: Vec::new(),
            pass_stdin: false,
            pass_env: false,
            pass_args: false,
            max_retries: 15,
            webhooks: Vec::new(),
            webhook_timeout: Duration::from_secs(30),
            webhook_payload: true,
            webhook_params: Vec::new(),
        }
    }
}

pub struct HandlerPipeline {
    config: PipelineConfig,
    http: reqwest::Client,
}

impl HandlerPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config, http: reqwest::Client::new() }
    }

    /// Predicate gate: anything but a non-empty render means skip.
    fn predicate_allows(&self, obj: &Object) -> bool {
        let Some(when) = &self.config.when else { return true };
        match when.render(obj.raw()) {
            Ok(value) if !value.is_empty() && value != "<no value>" => true,
            Ok(_) => {
                debug!(handler = %self.config.name, obj = %obj.key(), "predicate empty; skipping");
                false
            }
            Err(e) => {
                debug!(handler = %self.config.name, obj = %obj.key(), error = %e, "predicate failed; skipping");
                false
            }
        }
    }

    async fn run_command(
        &self,
        event: EventKind,
        obj: &Object,
        obj_json: &str,
        num_retries: u32,
    ) -> anyhow::Result<()> {
        let mut command = tokio::process::Command::new(&self.config.command[0]);
        command
            .args(&self.config.command[1..])
            .env("INFORMER_EVENT", event.as_str())
            .env("INFORMER_RETRIES", num_retries.to_string())
            .env("INFORMER_MAX_RETRIES", self.config.max_retries.to_string())
            .env("INFORMER_OBJECT_NAME", obj.name())
            .env("INFORMER_OBJECT_NAMESPACE", obj.namespace().unwrap_or(""))
            .env("INFORMER_OBJECT_API_VERSION", obj.api_version())
            .env("INFORMER_OBJECT_KIND", obj.kind())
            .env("INFORMER_RESOURCE_VERSION", obj.resource_version())
            .env("INFORMER_DELETION_TIMESTAMP", obj.deletion_timestamp())
            .env("INFORMER_CREATION_TIMESTAMP", obj.creation_timestamp())
            .stdin(if self.config.pass_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());
        if self.config.pass_env {
            command.env("INFORMER_OBJECT", obj_json);
        }
        if self.config.pass_args {
            command.arg(event.as_str()).arg(obj_json);
        }

        // The reaper must not race our own wait for this child.
        let _pause = reaper::pause();
        let mut child = command.spawn().context("spawn handler command")?;
        if self.config.pass_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(obj_json.as_bytes()).await.context("write handler stdin")?;
            }
        }
        if let Some(stderr) = child.stderr.take() {
            let name = self.config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    eprintln!("[{name}] {line}");
                }
            });
        }
        let status = child.wait().await.context("wait for handler command")?;
        if !status.success() {
            bail!("handler command failed: {status}");
        }
        Ok(())
    }

    async fn call_webhook(
        &self,
        base: &Url,
        event: EventKind,
        obj: &Object,
        obj_json: &str,
        num_retries: u32,
    ) -> anyhow::Result<()> {
        let mut url = base.clone();
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        set_param(&mut pairs, "event", event.as_str());
        if num_retries > 0 {
            set_param(&mut pairs, "retries", &num_retries.to_string());
        }
        for (name, template) in &self.config.webhook_params {
            match template.render(obj.raw()) {
                Ok(value) if !value.is_empty() && value != "<no value>" => {
                    set_param(&mut pairs, name, &value);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(handler = %self.config.name, param = %name, error = %e, "webhook param template failed; omitting");
                }
            }
        }
        url.query_pairs_mut().clear().extend_pairs(pairs.iter());

        let request = if self.config.webhook_payload {
            self.http
                .post(url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(obj_json.to_string())
        } else {
            self.http.get(url.clone())
        };
        let response = request
            .timeout(self.config.webhook_timeout)
            .send()
            .await
            .with_context(|| format!("webhook {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("webhook {url}: HTTP {status}");
        }
        debug!(handler = %self.config.name, webhook = %url, event = %event, "webhook delivered");
        Ok(())
    }
}

fn set_param(pairs: &mut Vec<(String, String)>, name: &str, value: &str) {
    pairs.retain(|(k, _)| k != name);
    pairs.push((name.to_string(), value.to_string()));
}

#[async_trait]
impl Handler for HandlerPipeline {
    async fn handle(&self, event: EventKind, obj: Object, num_retries: u32) -> anyhow::Result<()> {
        if !self.predicate_allows(&obj) {
            return Ok(());
        }
        if !self.config.events.contains(&event) {
            return Ok(());
        }
        let obj_json = obj.to_json().context("serialize object")?;
        if !self.config.command.is_empty() {
            self.run_command(event, &obj, &obj_json, num_retries).await?;
        } else {
            info!(
                "[{}] {} {}.{}: {}/{}",
                self.config.name,
                event,
                obj.api_version(),
                obj.kind(),
                obj.namespace().unwrap_or(""),
                obj.name()
            );
        }
        for webhook in &self.config.webhooks {
            self.call_webhook(webhook, event, &obj, &obj_json, num_retries).await?;
        }
        Ok(())
    }
}
