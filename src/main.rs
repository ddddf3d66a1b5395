use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use haiku_studio::channel::{ChannelManager, WsConnector};
use haiku_studio::client::StudioClient;
use haiku_studio::config::StudioConfig;
use haiku_studio::models::{EntityId, ProjectId};
use haiku_studio::pending::Action;
use haiku_studio::session::ProjectSession;
use haiku_studio::view::{Notice, TextView};

#[derive(Parser)]
#[command(name = "hstudio")]
#[command(about = "Live client for Haiku Studio projects")]
struct Cli {
    /// Server base URL, overriding the config file and HAIKU_STUDIO_URL
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new project and print its id
    CreateProject {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        purpose: String,
    },
    /// Follow a project live until interrupted
    Watch { project: String },
    /// Ask the server to write a haiku
    CreateHaiku { project: String, description: String },
    /// Ask for image prompts for a haiku
    RequestPrompts {
        project: String,
        haiku: String,

        /// Guidance for the prompt generator
        #[arg(long)]
        directions: Option<String>,
    },
    /// Generate an image from a prompt
    GenerateImage {
        project: String,
        prompt: String,

        /// Haiku the prompt belongs to
        #[arg(long)]
        haiku: String,
    },
    /// Ask for a critique of a haiku
    Critique { project: String, haiku: String },
    /// Replace the text of an image prompt
    EditPrompt {
        project: String,
        prompt: String,
        text: String,
    },
}

/// Initialize tracing with output to stderr (for watch mode) or stdout
fn init_tracing(use_stderr: bool) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "haiku_studio=debug,studio_core=info".into()),
    );

    if use_stderr {
        // Watch mode redraws the project on stdout
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let use_stderr = matches!(cli.command, Commands::Watch { .. });
    init_tracing(use_stderr);

    let mut config = StudioConfig::load();
    if let Some(url) = cli.url {
        config.base_url = url;
    }

    match cli.command {
        Commands::CreateProject { name, purpose } => {
            let client = StudioClient::new(config.base_url.clone());
            let project_id = client.create_project(&name, &purpose).await?;
            println!("{}", project_id);
        }
        Commands::Watch { project } => {
            let mut session = open_session(&config, ProjectId::from(project));
            let mut view = TextView::new(std::io::stdout());

            tokio::select! {
                _ = session.run_view(&mut view) => {}
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl-C")?;
                }
            }
            session.close().await;
        }
        Commands::CreateHaiku {
            project,
            description,
        } => {
            run_action(&config, project, Action::CreateHaiku { description }).await?;
        }
        Commands::RequestPrompts {
            project,
            haiku,
            directions,
        } => {
            let action = Action::RequestPrompts {
                haiku_id: EntityId::from(haiku),
                directions,
            };
            run_action(&config, project, action).await?;
        }
        Commands::GenerateImage {
            project,
            prompt,
            haiku,
        } => {
            let action = Action::GenerateImage {
                prompt_id: EntityId::from(prompt),
                haiku_id: EntityId::from(haiku),
            };
            run_action(&config, project, action).await?;
        }
        Commands::Critique { project, haiku } => {
            let action = Action::Critique {
                haiku_id: EntityId::from(haiku),
            };
            run_action(&config, project, action).await?;
        }
        Commands::EditPrompt {
            project,
            prompt,
            text,
        } => {
            let action = Action::EditPrompt {
                prompt_id: EntityId::from(prompt),
                text,
            };
            run_action(&config, project, action).await?;
        }
    }

    Ok(())
}

fn open_session(config: &StudioConfig, project_id: ProjectId) -> ProjectSession {
    let client = Arc::new(StudioClient::new(config.base_url.clone()));
    let channels = ChannelManager::new(
        WsConnector::from_http_base(&config.base_url),
        config.reconnect_policy(),
    );
    ProjectSession::open(project_id, &channels, client, config.session_config())
}

/// Submit one action once the project is visible and wait for its outcome.
async fn run_action(config: &StudioConfig, project: String, action: Action) -> anyhow::Result<()> {
    let mut session = open_session(config, ProjectId::from(project));
    let load_timeout = Duration::from_secs(config.stale_action_timeout_secs.max(1));

    tokio::time::timeout(load_timeout, session.wait_until_loaded())
        .await
        .context("Timed out waiting for the first project snapshot")??;

    let id = session.submit(action).await?;
    tracing::debug!("Submitted action {}", id);

    let notice = session.wait_for(id).await?;
    println!("{}", notice);
    session.close().await;

    if let Notice::Failed { reason, .. } = notice {
        anyhow::bail!("Action failed: {}", reason);
    }
    Ok(())
}
