use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use stackgate::catalog::Catalog;
use stackgate::config::{Config, CONFIG_ENV, DEFAULT_CONFIG_FILE};
use stackgate::models::Env;
use stackgate::nginx::NginxWriter;
use stackgate::reload::ProxyReloader;
use stackgate::routing::RoutingMapBuilder;
use stackgate::runner::{CommandRunner, ProcessRunner};
use stackgate::services;
use stackgate::store::{RegistryStore, YamlStore};
use stackgate::upstream::{ReconcileReport, Reconciler};
use stackgate::webhooks::{self, Decision, WebhookEvent, WebhookHandler, WebhookTarget};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "stackgate",
    version,
    about = "Registry-driven compose stacks behind a two-tier nginx edge"
)]
struct Cli {
    /// Settings file (default: $STACKGATE_CONFIG or ./stackgate.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level, including command output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write proxy config, reconcile every stack, then reload the proxy
    Apply,

    /// Check the registry and routing for errors
    Validate,

    /// Proxy configuration and reloads
    Proxy {
        #[command(subcommand)]
        cmd: ProxyCmd,
    },

    /// Project compose stacks
    Upstream {
        #[command(subcommand)]
        cmd: UpstreamCmd,
    },

    /// Inspect registry projects
    Project {
        #[command(subcommand)]
        cmd: ProjectCmd,
    },

    /// Service environment
    Env {
        #[command(subcommand)]
        cmd: EnvCmd,
    },

    /// CI webhook handling
    Webhook {
        #[command(subcommand)]
        cmd: WebhookCmd,
    },
}

#[derive(Subcommand, Debug)]
enum ProxyCmd {
    /// Regenerate map files and nginx configs
    Write,
    /// Reload one proxy service, or edge then terminate
    Reload { service: Option<String> },
}

#[derive(Subcommand, Debug)]
enum UpstreamCmd {
    /// Bring one project's stack in line with the registry
    Update {
        project: String,
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        rollout: bool,
    },
    /// Reconcile every stack directory
    Reconcile,
    /// Render compose files without running anything
    Write,
}

#[derive(Subcommand, Debug)]
enum ProjectCmd {
    List,
    Show { name: String },
}

#[derive(Subcommand, Debug)]
enum EnvCmd {
    /// Merge KEY=VALUE pairs into a service's environment
    Set {
        project: String,
        service: String,
        #[arg(required = true)]
        pairs: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum WebhookCmd {
    /// Process one webhook delivery
    Handle {
        /// Event type (X-GitHub-Event)
        #[arg(long)]
        event: String,
        #[arg(long)]
        project: String,
        #[arg(long)]
        service: Option<String>,
        /// File holding the raw request body
        #[arg(long)]
        payload: PathBuf,
        /// X-Hub-Signature-256 header value
        #[arg(long)]
        signature: Option<String>,
    },
    /// Print a new random webhook secret
    Secret,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;

    runtime.block_on(run(cli.command, config))
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "stackgate=debug,compose=debug"
    } else {
        "stackgate=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut config = Config::load_or_default(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;

    // Relative paths in a settings file are relative to that file
    if path.exists() {
        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.paths.rebase(base);
        }
    }

    Ok(config)
}

async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(config.commands.timeout()));
    let store = YamlStore::new(&config.paths.registry);

    match command {
        Command::Apply => {
            let reconciler = Reconciler::from_config(store, runner, &config);
            apply(&reconciler, &NginxWriter::from_config(&config)).await?;
            info!("Apply finished");
        }

        Command::Validate => {
            let registry = store
                .load()
                .with_context(|| format!("Invalid registry {}", config.paths.registry.display()))?;
            let maps = RoutingMapBuilder::new(&config.proxy.terminate_host, config.proxy.terminate_port)
                .build(&services::enumerate(&registry))?;
            println!(
                "Registry OK: {} projects, {} terminated domains, {} passthrough domains",
                registry.projects.len(),
                maps.internal.len(),
                maps.passthrough.len()
            );
        }

        Command::Proxy { cmd } => match cmd {
            ProxyCmd::Write => {
                let registry = store.load()?;
                NginxWriter::from_config(&config).write_nginx(&registry)?;
            }
            ProxyCmd::Reload { service } => {
                ProxyReloader::from_config(runner, &config)
                    .reload_proxy(service.as_deref())
                    .await?;
            }
        },

        Command::Upstream { cmd } => {
            let reconciler = Reconciler::from_config(store, runner, &config);
            match cmd {
                UpstreamCmd::Update {
                    project,
                    service,
                    rollout,
                } => {
                    reconciler
                        .update_upstream(&project, service.as_deref(), rollout)
                        .await?;
                }
                UpstreamCmd::Reconcile => {
                    let report = reconciler.update_upstreams().await?;
                    check_report(&report)?;
                }
                UpstreamCmd::Write => {
                    for path in reconciler.write_upstreams()? {
                        println!("{}", path.display());
                    }
                }
            }
        }

        Command::Project { cmd } => {
            let catalog = Catalog::new(store);
            match cmd {
                ProjectCmd::List => {
                    for project in catalog.get_projects()? {
                        println!(
                            "{:<24} {:<8} {} services",
                            project.name,
                            if project.enabled { "enabled" } else { "disabled" },
                            project.services.len()
                        );
                    }
                }
                ProjectCmd::Show { name } => {
                    let project = catalog.get_project(&name)?;
                    print!("{}", serde_yaml::to_string(&project)?);
                }
            }
        }

        Command::Env { cmd } => match cmd {
            EnvCmd::Set {
                project,
                service,
                pairs,
            } => {
                let env = Env::from_pairs(&pairs).map_err(anyhow::Error::msg)?;
                Catalog::new(store).upsert_env(&project, &service, env)?;
                info!(project = %project, service = %service, "Environment updated");
            }
        },

        Command::Webhook { cmd } => match cmd {
            WebhookCmd::Handle {
                event,
                project,
                service,
                payload,
                signature,
            } => {
                let event: WebhookEvent = event.parse().map_err(anyhow::Error::msg)?;
                let body = std::fs::read(&payload)
                    .with_context(|| format!("Failed to read payload {}", payload.display()))?;
                let target = WebhookTarget::new(&project, service.as_deref());

                let handler = WebhookHandler::new(config.webhook.secret.clone());
                let decision = handler.handle(event, &target, &body, signature.as_deref())?;

                match &decision {
                    Decision::Pong(zen) => println!("pong: {}", zen),
                    Decision::Ignore(reason) => println!("ignored: {}", reason),
                    Decision::Rollout { .. } => {
                        let reconciler = Reconciler::from_config(store, runner, &config);
                        webhooks::apply(&decision, &reconciler).await?;
                        println!("rolled out {}", project);
                    }
                }
            }
            WebhookCmd::Secret => println!("{}", webhooks::generate_webhook_secret()),
        },
    }

    Ok(())
}

/// Write proxy config, reconcile every stack, then reload the proxy.
/// Reconcile failures are logged before the reload is attempted.
async fn apply<S: RegistryStore>(reconciler: &Reconciler<S>, writer: &NginxWriter) -> anyhow::Result<()> {
    let registry = reconciler.catalog().registry()?;

    writer.write_nginx(&registry)?;
    let report = reconciler.update_upstreams().await?;
    let reconciled = check_report(&report);
    reconciler
        .reloader()
        .reload_proxy(None)
        .await
        .context("Proxy reload failed")?;
    reconciled
}

fn check_report(report: &ReconcileReport) -> anyhow::Result<()> {
    for failure in report.failures() {
        if let Err(e) = &failure.result {
            error!(project = %failure.project, "{}", e);
        }
    }
    if !report.is_success() {
        bail!(
            "{} of {} projects failed to reconcile",
            report.failures().count(),
            report.outcomes.len()
        );
    }
    Ok(())
}
