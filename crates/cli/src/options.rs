//! Flag and environment parsing. Every flag has an `INFORMER_OPTS_` env
//! twin; configuration problems fail fast before any loop starts.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{ArgAction, Parser};
use manta_cluster::KubeClusterOptions;
use manta_core::expr::Template;
use manta_core::{EventKind, WatchSpec};
use manta_engine::{EngineOptions, PipelineConfig};
use manta_server::ServerConfig;
use manta_store::IndexFn;
use tracing::{debug, warn};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "manta",
    version,
    about = "Generic cluster-resource event bridge",
    override_usage = "manta [flags] -- handlerCommand args..."
)]
pub struct Options {
    /// Watch resources, eg. `apiVersion=v1,kind=ConfigMap`; `:` separates
    /// multiple specs per value
    #[arg(short = 'w', long = "watch", env = "INFORMER_OPTS_WATCH", value_delimiter = ':')]
    pub watch: Vec<String>,

    /// Selector (label query) to filter on, applied to every watch
    #[arg(short = 'l', long = "selector", env = "INFORMER_OPTS_SELECTOR", default_value = "")]
    pub selector: String,

    /// Selector (field query) to filter on, applied to every watch
    #[arg(long = "field-selector", env = "INFORMER_OPTS_FIELD_SELECTOR", default_value = "")]
    pub field_selector: String,

    /// Resync period, 0 disables
    #[arg(long = "resync", env = "INFORMER_OPTS_RESYNC", default_value = "0", value_parser = parse_duration)]
    pub resync: Duration,

    /// Event kinds that invoke the handler
    #[arg(short = 'e', long = "event", env = "INFORMER_OPTS_EVENT", value_delimiter = ',', default_value = "add,update,delete")]
    pub event: Vec<String>,

    /// Handler name used in log prefixes
    #[arg(long = "name", env = "INFORMER_OPTS_NAME")]
    pub name: Option<String>,

    /// Skip the event when this template renders empty or fails
    #[arg(long = "when", env = "INFORMER_OPTS_WHEN")]
    pub when: Option<String>,

    /// Handler webhook URL (repeatable)
    #[arg(long = "webhook", env = "INFORMER_OPTS_WEBHOOK")]
    pub webhook: Vec<String>,

    /// Per-webhook request timeout
    #[arg(long = "webhook-timeout", env = "INFORMER_OPTS_WEBHOOK_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub webhook_timeout: Duration,

    /// POST the object JSON to webhooks; false sends GET without a body
    #[arg(long = "webhook-payload", env = "INFORMER_OPTS_WEBHOOK_PAYLOAD", default_value_t = true, action = ArgAction::Set)]
    pub webhook_payload: bool,

    /// Additional webhook query param, `name={{.metadata.name}}` (repeatable)
    #[arg(long = "webhook-param", env = "INFORMER_OPTS_WEBHOOK_PARAM")]
    pub webhook_param: Vec<String>,

    /// Pass the object JSON to handler stdin
    #[arg(long = "pass-stdin", env = "INFORMER_OPTS_PASS_STDIN", action = ArgAction::SetTrue)]
    pub pass_stdin: bool,

    /// Pass the object JSON in the INFORMER_OBJECT env var
    #[arg(long = "pass-env", env = "INFORMER_OPTS_PASS_ENV", action = ArgAction::SetTrue)]
    pub pass_env: bool,

    /// Append the event name and object JSON to the handler argv
    #[arg(long = "pass-args", env = "INFORMER_OPTS_PASS_ARGS", action = ArgAction::SetTrue)]
    pub pass_args: bool,

    /// Handler max retries, -1 for unlimited
    #[arg(long = "max-retries", env = "INFORMER_OPTS_MAX_RETRIES", default_value_t = 15)]
    pub max_retries: i64,

    /// Retry backoff: base delay
    #[arg(long = "retries-base-delay", env = "INFORMER_OPTS_RETRIES_BASE_DELAY", default_value = "5ms", value_parser = parse_duration)]
    pub retries_base_delay: Duration,

    /// Retry backoff: max delay
    #[arg(long = "retries-max-delay", env = "INFORMER_OPTS_RETRIES_MAX_DELAY", default_value = "1000s", value_parser = parse_duration)]
    pub retries_max_delay: Duration,

    /// Global requeue limit: rate per second
    #[arg(long = "limit-rate", env = "INFORMER_OPTS_LIMIT_RATE", default_value_t = 10.0)]
    pub limit_rate: f64,

    /// Global requeue limit: bursts
    #[arg(long = "limit-bursts", env = "INFORMER_OPTS_LIMIT_BURSTS", default_value_t = 100)]
    pub limit_bursts: u32,

    /// HTTP server bind addr, eg. `:8080`
    #[arg(long = "http-server", env = "INFORMER_OPTS_HTTP_SERVER")]
    pub http_server: Option<String>,

    /// (DEPRECATED) use --http-server instead
    #[arg(long = "index-server", env = "INFORMER_OPTS_INDEX_SERVER", hide = true)]
    pub index_server: Option<String>,

    /// Secondary index, `by-node={{.spec.nodeName}}` (repeatable)
    #[arg(long = "index", env = "INFORMER_OPTS_INDEX")]
    pub index: Vec<String>,

    /// Enable the API reverse proxy with a client allowlist, eg. `127.0.0.1, 10.0.0.0/8`
    #[arg(long = "api-proxy", env = "INFORMER_OPTS_API_PROXY")]
    pub api_proxy: Option<String>,

    /// Template delimiters
    #[arg(long = "template-delims", env = "INFORMER_OPTS_TEMPLATE_DELIMS", default_value = "{{,}}")]
    pub template_delims: String,

    /// Path to the kubeconfig file
    #[arg(long = "kubeconfig", env = "INFORMER_OPTS_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// URL of the cluster API server
    #[arg(short = 's', long = "server", env = "INFORMER_OPTS_SERVER")]
    pub server: Option<String>,

    /// Namespace to watch
    #[arg(short = 'n', long = "namespace", env = "INFORMER_OPTS_NAMESPACE")]
    pub namespace: Option<String>,

    /// Watch all namespaces
    #[arg(long = "all-namespaces", env = "INFORMER_OPTS_ALL_NAMESPACES", action = ArgAction::SetTrue)]
    pub all_namespaces: bool,

    /// Leader election lock, `[endpoints|configmaps|leases/]<object name>`
    #[arg(long = "leader-elect", env = "INFORMER_OPTS_LEADER_ELECT")]
    pub leader_elect: Option<String>,

    /// Leader election: lock object namespace
    #[arg(long = "leader-elect-namespace", env = "INFORMER_OPTS_LEADER_ELECT_NAMESPACE")]
    pub leader_elect_namespace: Option<String>,

    /// Leader election: lease duration
    #[arg(long = "leader-elect-lease", env = "INFORMER_OPTS_LEADER_ELECT_LEASE", default_value = "15s", value_parser = parse_duration)]
    pub leader_elect_lease: Duration,

    /// Leader election: renew deadline
    #[arg(long = "leader-elect-renew", env = "INFORMER_OPTS_LEADER_ELECT_RENEW", default_value = "10s", value_parser = parse_duration)]
    pub leader_elect_renew: Duration,

    /// Leader election: retry period
    #[arg(long = "leader-elect-retry", env = "INFORMER_OPTS_LEADER_ELECT_RETRY", default_value = "2s", value_parser = parse_duration)]
    pub leader_elect_retry: Duration,

    /// Handler command and arguments, after `--`
    #[arg(last = true)]
    pub handler_command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LeaderOptions {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

/// Everything the runtime needs, validated and compiled.
pub struct Config {
    pub watches: Vec<WatchSpec>,
    pub cluster: KubeClusterOptions,
    pub pipeline: PipelineConfig,
    pub engine: EngineOptions,
    pub indexers: HashMap<String, IndexFn>,
    pub server: Option<ServerConfig>,
    pub leader: Option<LeaderOptions>,
}

impl Config {
    pub fn from_options(opts: &Options) -> anyhow::Result<Config> {
        let delims = parse_delims(&opts.template_delims)?;

        let mut watches = Vec::new();
        for value in &opts.watch {
            if value.trim().is_empty() {
                continue;
            }
            watches.push(parse_watch(value, opts));
        }
        if watches.is_empty() {
            bail!("--watch required");
        }

        let mut events = HashSet::new();
        for event in &opts.event {
            events.insert(event.parse::<EventKind>().map_err(|e| anyhow!(e))?);
        }

        let when = opts
            .when
            .as_deref()
            .map(|text| compile(text, delims).context("parse --when template"))
            .transpose()?;

        let mut webhooks = Vec::new();
        for raw in &opts.webhook {
            webhooks.push(Url::parse(raw).with_context(|| format!("parse webhook {raw}"))?);
        }
        let mut webhook_params = Vec::new();
        for raw in &opts.webhook_param {
            let (name, template) = split_assignment(raw).context("parse --webhook-param")?;
            webhook_params.push((
                name.to_string(),
                compile(template, delims).with_context(|| format!("parse webhook param {name}"))?,
            ));
        }

        let name = opts.name.clone().unwrap_or_else(|| default_handler_name(&opts.handler_command));

        let http_addr = match (&opts.http_server, &opts.index_server) {
            (Some(addr), _) => Some(addr.clone()),
            (None, Some(addr)) => {
                warn!("--index-server is deprecated, use --http-server");
                Some(addr.clone())
            }
            (None, None) => None,
        };

        let mut indexers: HashMap<String, IndexFn> = HashMap::new();
        if http_addr.is_some() {
            for raw in &opts.index {
                let (index_name, template) = split_assignment(raw).context("parse --index")?;
                let compiled = compile(template, delims)
                    .with_context(|| format!("parse index {index_name}"))?;
                let log_name = index_name.to_string();
                indexers.insert(
                    index_name.to_string(),
                    Arc::new(move |obj: &manta_core::Object| match compiled.render(obj.raw()) {
                        Ok(key) if !key.is_empty() && key != "<no value>" => vec![key],
                        Ok(_) => Vec::new(),
                        Err(e) => {
                            debug!(index = %log_name, obj = %obj.key(), error = %e, "index template failed");
                            Vec::new()
                        }
                    }),
                );
            }
        }

        let server = http_addr.map(|addr| ServerConfig {
            addr,
            api_proxy_allow: opts.api_proxy.clone(),
            ..ServerConfig::default()
        });

        let leader = opts
            .leader_elect
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|value| {
                let (kind, name) = match value.find('/') {
                    Some(idx) if idx > 0 => (&value[..idx], &value[idx + 1..]),
                    _ => ("endpoints", value),
                };
                LeaderOptions {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    namespace: opts.leader_elect_namespace.clone(),
                    lease_duration: opts.leader_elect_lease,
                    renew_deadline: opts.leader_elect_renew,
                    retry_period: opts.leader_elect_retry,
                }
            });

        Ok(Config {
            watches,
            cluster: KubeClusterOptions {
                kubeconfig: opts.kubeconfig.clone(),
                server: opts.server.clone(),
                namespace: opts.namespace.clone(),
                all_namespaces: opts.all_namespaces,
            },
            pipeline: PipelineConfig {
                name,
                events,
                when,
                command: opts.handler_command.clone(),
                pass_stdin: opts.pass_stdin,
                pass_env: opts.pass_env,
                pass_args: opts.pass_args,
                max_retries: opts.max_retries,
                webhooks,
                webhook_timeout: opts.webhook_timeout,
                webhook_payload: opts.webhook_payload,
                webhook_params,
            },
            engine: EngineOptions {
                max_retries: opts.max_retries,
                retries_base_delay: opts.retries_base_delay,
                retries_max_delay: opts.retries_max_delay,
                limit_rate: opts.limit_rate,
                limit_bursts: opts.limit_bursts,
            },
            indexers,
            server,
            leader,
        })
    }
}

fn compile(text: &str, delims: (&str, &str)) -> anyhow::Result<Template> {
    Template::compile(text, delims).map_err(|e| anyhow!(e))
}

fn parse_delims(raw: &str) -> anyhow::Result<(&str, &str)> {
    match raw.split_once(',') {
        Some((open, close)) if !open.is_empty() && !close.is_empty() => Ok((open, close)),
        _ => bail!("invalid --template-delims"),
    }
}

/// `apiVersion=v1,kind=ConfigMap` with apiVersion defaulting to `v1`. The
/// namespace is filled in at startup from the cluster client scope.
fn parse_watch(value: &str, opts: &Options) -> WatchSpec {
    let mut spec = WatchSpec::new("v1", "");
    for part in value.split(',') {
        if let Some((k, v)) = part.split_once('=') {
            match k.trim() {
                "apiVersion" => spec.api_version = v.trim().to_string(),
                "kind" => spec.kind = v.trim().to_string(),
                other => debug!(key = other, "ignoring unknown watch option"),
            }
        }
    }
    spec.label_selector = opts.selector.clone();
    spec.field_selector = opts.field_selector.clone();
    spec.resync = opts.resync;
    spec
}

fn split_assignment(raw: &str) -> anyhow::Result<(&str, &str)> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim(), v))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| anyhow!("expected name=template, got {raw:?}"))
}

fn default_handler_name(command: &[String]) -> String {
    command
        .first()
        .and_then(|arg0| {
            std::path::Path::new(arg0).file_name().map(|f| f.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "event".to_string())
}

/// Compound duration strings: `300ms`, `30s`, `1m30s`, `2h`. Bare `0` is zero.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw == "0" {
        return Ok(Duration::ZERO);
    }
    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration {raw:?}"))?;
        if digits == 0 {
            return Err(format!("invalid duration {raw:?}"));
        }
        let value: f64 = rest[..digits].parse().map_err(|_| format!("invalid duration {raw:?}"))?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let secs = match unit {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(format!("unknown duration unit {other:?} in {raw:?}")),
        };
        total += Duration::from_secs_f64(value * secs);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("manta").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn watch_values_split_on_colon_and_default_api_version() {
        let opts = parse(&["--watch", "kind=ConfigMap:apiVersion=apps/v1,kind=Deployment"]);
        let config = Config::from_options(&opts).unwrap();
        assert_eq!(config.watches.len(), 2);
        assert_eq!(config.watches[0].api_version, "v1");
        assert_eq!(config.watches[0].kind, "ConfigMap");
        assert_eq!(config.watches[1].api_version, "apps/v1");
        assert_eq!(config.watches[1].kind, "Deployment");
    }

    #[test]
    fn missing_watch_is_a_configuration_error() {
        let opts = parse(&[]);
        assert!(Config::from_options(&opts).is_err());
    }

    #[test]
    fn handler_name_defaults_to_command_basename() {
        let opts = parse(&["--watch", "kind=Pod", "--", "/usr/local/bin/on-event", "arg"]);
        let config = Config::from_options(&opts).unwrap();
        assert_eq!(config.pipeline.name, "on-event");
        assert_eq!(config.pipeline.command, vec!["/usr/local/bin/on-event", "arg"]);

        let opts = parse(&["--watch", "kind=Pod"]);
        let config = Config::from_options(&opts).unwrap();
        assert_eq!(config.pipeline.name, "event");
    }

    #[test]
    fn bad_templates_fail_fast() {
        let opts = parse(&["--watch", "kind=Pod", "--when", "{{.metadata.name"]);
        assert!(Config::from_options(&opts).is_err());

        let opts = parse(&["--watch", "kind=Pod", "--http-server", ":8080", "--index", "broken"]);
        assert!(Config::from_options(&opts).is_err());
    }

    #[test]
    fn custom_template_delims() {
        let opts = parse(&[
            "--watch", "kind=Pod",
            "--template-delims", "[[,]]",
            "--when", "[[.metadata.name]]",
        ]);
        let config = Config::from_options(&opts).unwrap();
        assert!(config.pipeline.when.is_some());
    }

    #[test]
    fn leader_lock_kind_prefix() {
        let opts = parse(&["--watch", "kind=Pod", "--leader-elect", "leases/my-lock"]);
        let config = Config::from_options(&opts).unwrap();
        let leader = config.leader.unwrap();
        assert_eq!(leader.kind, "leases");
        assert_eq!(leader.name, "my-lock");

        let opts = parse(&["--watch", "kind=Pod", "--leader-elect", "my-lock"]);
        let leader = Config::from_options(&opts).unwrap().leader.unwrap();
        assert_eq!(leader.kind, "endpoints");
        assert_eq!(leader.name, "my-lock");
    }

    #[test]
    fn indexes_are_only_compiled_with_an_http_server() {
        let opts = parse(&["--watch", "kind=Pod", "--index", "by-node={{.spec.nodeName}}"]);
        let config = Config::from_options(&opts).unwrap();
        assert!(config.indexers.is_empty());

        let opts = parse(&[
            "--watch", "kind=Pod",
            "--http-server", ":8080",
            "--index", "by-node={{.spec.nodeName}}",
        ]);
        let config = Config::from_options(&opts).unwrap();
        assert!(config.indexers.contains_key("by-node"));
        assert!(config.server.is_some());
    }

    #[test]
    fn events_subset() {
        let opts = parse(&["--watch", "kind=Pod", "--event", "add,delete"]);
        let config = Config::from_options(&opts).unwrap();
        assert!(config.pipeline.events.contains(&EventKind::Add));
        assert!(!config.pipeline.events.contains(&EventKind::Update));

        let opts = parse(&["--watch", "kind=Pod", "--event", "bogus"]);
        assert!(Config::from_options(&opts).is_err());
    }
}
