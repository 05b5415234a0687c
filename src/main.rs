//! stackrun - orchestrator for a four-service container stack
//!
//! This is the main CLI entry point for stackrun.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use stackrun::compose::topology::{default_topology, verify_connection_env, TEMPLATE};
use stackrun::compose::{ComposeConfig, ComposeOrchestrator, ComposeParser, DependencyGraph};
use stackrun::container::ContainerManager;
use stackrun::launcher::{LauncherScript, SiblingFailurePolicy, Supervisor};
use stackrun::network::NetworkManager;
use stackrun::settings::RuntimeBackend;
use stackrun::Settings;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// stackrun - dependency-ordered container stack orchestrator
#[derive(Parser)]
#[command(name = "stackrun")]
#[command(version)]
#[command(about = "Bring up and supervise a four-service container stack", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root of the host directories mounted into the stack
    #[arg(long, global = true, env = "STACKRUN_DATA_ROOT")]
    data_root: Option<PathBuf>,

    /// Project name
    #[arg(short, long, global = true, env = "STACKRUN_PROJECT")]
    project: Option<String>,

    /// Container backend
    #[arg(long, global = true, value_enum, env = "STACKRUN_RUNTIME")]
    runtime: Option<RuntimeBackend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start the stack
    Up {
        /// Compose files, later ones overriding earlier ones; the built-in
        /// stack is used when none is given or found
        #[arg(short, long)]
        file: Vec<PathBuf>,
        /// Wait for each service's readiness probe before starting dependents
        #[arg(long)]
        wait_ready: bool,
        /// Give up on a service after this many failed starts
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Return once started instead of supervising restarts
        #[arg(short, long)]
        detach: bool,
        /// Services to start, with their dependencies; all when omitted
        services: Vec<String>,
    },
    /// Start containers a host restart left down, then supervise them
    Resume {
        /// Compose file
        #[arg(short, long)]
        file: Vec<PathBuf>,
        /// Return once resumed instead of supervising restarts
        #[arg(short, long)]
        detach: bool,
    },
    /// Stop and remove the stack
    Down {
        /// Compose file
        #[arg(short, long)]
        file: Vec<PathBuf>,
        /// Remove host directories created by `up`
        #[arg(short, long)]
        volumes: bool,
    },
    /// List the stack's services
    Ps {
        /// Compose file
        #[arg(short, long)]
        file: Vec<PathBuf>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate and print the compose configuration
    Config {
        /// Compose file
        #[arg(short, long)]
        file: Vec<PathBuf>,
    },
    /// Print the start waves
    Order {
        /// Compose file
        #[arg(short, long)]
        file: Vec<PathBuf>,
    },
    /// Start services
    Start {
        /// Compose file
        #[arg(short, long)]
        file: Vec<PathBuf>,
        /// Service names
        #[arg(required = true)]
        services: Vec<String>,
    },
    /// Stop services
    Stop {
        /// Compose file
        #[arg(short, long)]
        file: Vec<PathBuf>,
        /// Service names
        #[arg(required = true)]
        services: Vec<String>,
    },
    /// Restart services
    Restart {
        /// Compose file
        #[arg(short, long)]
        file: Vec<PathBuf>,
        /// Service names
        #[arg(required = true)]
        services: Vec<String>,
    },
    /// Remove service containers
    #[command(name = "rm")]
    Remove {
        /// Compose file
        #[arg(short, long)]
        file: Vec<PathBuf>,
        /// Service names
        #[arg(required = true)]
        services: Vec<String>,
    },
    /// Print the built-in compose file
    Topology {
        /// Print the template without interpolating it
        #[arg(long)]
        raw: bool,
    },
    /// Print the launcher script
    Script {
        /// Also write it here
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Start the server container's processes
    Launch {
        #[arg(long, value_enum, default_value = "script")]
        mode: LaunchMode,
        /// Where the script is written
        #[arg(long)]
        path: Option<PathBuf>,
        /// What a background process exit does in supervise mode
        #[arg(long, value_enum)]
        sibling_failure: Option<SiblingFailurePolicy>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LaunchMode {
    /// Write the launcher script and run it with bash
    Script,
    /// Run the processes under the supervisor
    Supervise,
}

/// A loaded compose project
struct Project {
    name: String,
    config: ComposeConfig,
    working_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(data_root) = cli.data_root.clone() {
        settings.data_root = data_root;
    }
    if let Some(project) = cli.project.clone() {
        settings.project_name = Some(project);
    }
    if let Some(backend) = cli.runtime {
        settings.runtime.backend = backend;
    }

    match cli.command {
        Commands::Up {
            file,
            wait_ready,
            max_attempts,
            detach,
            services,
        } => {
            let project = load_project(&file, &settings)?;
            let mut options = settings.startup.to_options();
            options.wait_ready |= wait_ready;
            if max_attempts.is_some() {
                options.max_start_attempts = max_attempts;
            }

            let wait_ready = options.wait_ready;
            let name = project.name.clone();
            let mut orchestrator = orchestrator(project, &settings)?.with_options(options);

            if wait_ready {
                let registered = orchestrator.register_default_probes()?;
                tracing::debug!(probes = registered, "derived readiness probes");
            }

            orchestrator
                .up_services(&services)
                .await
                .with_context(|| format!("failed to bring up project {}", name))?;
            println!("Started project {}", name);

            if !detach {
                supervise(&orchestrator).await?;
            }
        }

        Commands::Resume { file, detach } => {
            let project = load_project(&file, &settings)?;
            let orchestrator = orchestrator(project, &settings)?;
            let resumed = orchestrator.resume().await?;
            println!("Resumed {} containers", resumed.len());

            if !detach {
                supervise(&orchestrator).await?;
            }
        }

        Commands::Down { file, volumes } => {
            let project = load_project(&file, &settings)?;
            let name = project.name.clone();
            orchestrator(project, &settings)?
                .down(volumes)
                .await
                .with_context(|| format!("failed to tear down project {}", name))?;
            println!("Removed project {}", name);
        }

        Commands::Ps { file, json } => {
            let project = load_project(&file, &settings)?;
            let statuses = orchestrator(project, &settings)?.status()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                println!("{:<28} {:<16} {:<12} PORTS", "NAME", "SERVICE", "STATUS");
                for status in statuses {
                    let state = status
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "absent".to_string());
                    let ports = status
                        .ports
                        .iter()
                        .map(|p| p.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    println!(
                        "{:<28} {:<16} {:<12} {}",
                        status.container, status.service, state, ports
                    );
                }
            }
        }

        Commands::Config { file } => {
            let project = load_project(&file, &settings)?;
            let warnings = ComposeParser::validate(&project.config)?;

            for warning in warnings {
                eprintln!("Warning: {}", warning);
            }

            print!("{}", serde_yaml::to_string(&project.config)?);
        }

        Commands::Order { file } => {
            let project = load_project(&file, &settings)?;
            let graph = DependencyGraph::from_config(&project.config)?;
            let waves = graph.start_waves()?;
            println!("{} services in {} waves", graph.len(), waves.len());
            for (index, wave) in waves.iter().enumerate() {
                println!("{}: {}", index, wave.join(" "));
                for service in wave {
                    let deps = graph.dependencies(service);
                    if !deps.is_empty() {
                        println!("   {} <- {}", service, deps.join(", "));
                    }
                }
            }
        }

        Commands::Start { file, services } => {
            let project = load_project(&file, &settings)?;
            let orchestrator = orchestrator(project, &settings)?;
            for service in services {
                orchestrator
                    .start_service(&service)
                    .await
                    .with_context(|| format!("failed to start {}", service))?;
                println!("Started {}", service);
            }
        }

        Commands::Stop { file, services } => {
            let project = load_project(&file, &settings)?;
            let orchestrator = orchestrator(project, &settings)?;
            for service in services {
                orchestrator
                    .stop_service(&service)
                    .await
                    .with_context(|| format!("failed to stop {}", service))?;
                println!("Stopped {}", service);
            }
        }

        Commands::Restart { file, services } => {
            let project = load_project(&file, &settings)?;
            let orchestrator = orchestrator(project, &settings)?;
            for service in services {
                orchestrator
                    .restart_service(&service)
                    .await
                    .with_context(|| format!("failed to restart {}", service))?;
                println!("Restarted {}", service);
            }
        }

        Commands::Remove { file, services } => {
            let project = load_project(&file, &settings)?;
            let orchestrator = orchestrator(project, &settings)?;
            for service in services {
                orchestrator
                    .remove_service(&service)
                    .await
                    .with_context(|| format!("failed to remove {}", service))?;
                println!("Removed {}", service);
            }
        }

        Commands::Topology { raw } => {
            if raw {
                print!("{}", TEMPLATE);
            } else {
                let config = default_topology(&settings.data_root)?;
                print!("{}", serde_yaml::to_string(&config)?);
            }
        }

        Commands::Script { path } => {
            let script = launcher_script(&settings);
            script.validate()?;
            print!("{}", script.render());

            if let Some(path) = path {
                script.write_to(&path)?;
            }
        }

        Commands::Launch {
            mode,
            path,
            sibling_failure,
        } => {
            let script = launcher_script(&settings);
            let code = match mode {
                LaunchMode::Script => {
                    let path = path.unwrap_or_else(|| settings.launcher.script_path.clone());
                    let written = script
                        .write_to(&path)
                        .context("failed to write launcher script")?;
                    LauncherScript::execute(&written).await?
                }
                LaunchMode::Supervise => {
                    let policy = sibling_failure.unwrap_or(settings.launcher.sibling_failure);
                    Supervisor::new(&script, policy)?.run().await?
                }
            };

            if code != 0 {
                tracing::error!(exit_code = code, "launcher exited");
                std::process::exit(code);
            }
        }
    }

    Ok(())
}

fn launcher_script(settings: &Settings) -> LauncherScript {
    LauncherScript::standard(&settings.launcher.wrapper)
        .exec_foreground(settings.launcher.exec_foreground)
}

/// Apply restart policies until every container stays down or Ctrl-C
async fn supervise(orchestrator: &ComposeOrchestrator) -> anyhow::Result<()> {
    tokio::select! {
        watched = orchestrator.watch() => watched.context("failed to supervise containers")?,
        _ = tokio::signal::ctrl_c() => {
            println!("Detached; containers keep running");
        }
    }
    Ok(())
}

fn orchestrator(project: Project, settings: &Settings) -> anyhow::Result<ComposeOrchestrator> {
    let containers =
        ContainerManager::open_with_runtime(settings.containers_dir(), settings.runtime.build())
            .context("failed to open container state")?;
    let networks =
        NetworkManager::open(settings.networks_dir()).context("failed to open network state")?;

    Ok(ComposeOrchestrator::new(
        &project.name,
        project.config,
        Arc::new(containers),
        Arc::new(networks),
        project.working_dir,
    ))
}

/// Load compose files, or the built-in stack when none is given or found
fn load_project(files: &[PathBuf], settings: &Settings) -> anyhow::Result<Project> {
    let working_dir = std::env::current_dir()?;

    let files: Vec<PathBuf> = match files {
        [] => ComposeParser::find_compose_file(&working_dir)
            .into_iter()
            .collect(),
        given => given.to_vec(),
    };

    let Some(compose_file) = files.first().cloned() else {
        tracing::debug!("no compose file found, using the built-in stack");
        let config = default_topology(&settings.data_root)?;
        verify_connection_env(&config)?;
        let name = settings
            .project_name
            .clone()
            .or_else(|| config.name.clone())
            .unwrap_or_else(|| "stack".to_string());
        return Ok(Project {
            name,
            config,
            working_dir,
        });
    };

    if let Some(missing) = files.iter().find(|f| !f.exists()) {
        bail!("compose file {} does not exist", missing.display());
    }

    let paths: Vec<&Path> = files.iter().map(PathBuf::as_path).collect();
    let mut config = ComposeParser::parse_files(&paths)
        .with_context(|| format!("failed to load {}", compose_file.display()))?;

    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.entry("DATA_ROOT".to_string())
        .or_insert_with(|| settings.data_root.to_string_lossy().to_string());
    ComposeParser::interpolate(&mut config, &env);

    let project_dir = compose_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or(working_dir);

    let name = settings
        .project_name
        .clone()
        .or_else(|| config.name.clone())
        .unwrap_or_else(|| {
            project_dir
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("default")
                .to_string()
        });

    Ok(Project {
        name,
        config,
        working_dir: project_dir,
    })
}
