// src/main.rs

use clap::{Parser, Subcommand};
use quarry::{
    BarProgress, Context, GraphBuilder, GraphOptions, Profile, RecipeReference, Remote,
    Requirement, RootSpec,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(author, version, about = "C/C++ package manager: resolve, fetch and cache binary dependencies", long_about = None)]
struct Cli {
    /// Cache root directory
    #[arg(long, default_value = ".quarry", global = true)]
    cache_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a dependency graph, fetching recipes as needed
    Install {
        /// Reference (name/version[@user/channel]) or path to a recipe file
        target: String,
        /// Replace cached recipes when a remote has newer content
        #[arg(long)]
        update: bool,
        /// Restrict remote operations to one named remote
        #[arg(short, long)]
        remote: Option<String>,
        /// Host settings as key=value (repeatable)
        #[arg(short, long = "setting")]
        settings: Vec<String>,
        /// Print the resolved graph as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export a local recipe folder into the cache
    Export {
        /// Folder containing the recipe files
        path: PathBuf,
        /// Reference to export as (name/version[@user/channel])
        reference: String,
    },
    /// Inspect or evict cache contents
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Manage the remote registry
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached recipe references
    List {
        /// Show every revision instead of only the latest per reference
        #[arg(long)]
        all_revisions: bool,
    },
    /// Evict a recipe revision (packages included)
    Remove {
        /// Pinned reference (name/version[@user/channel]#rrev)
        reference: String,
    },
    /// Verify a cached recipe against its manifest
    Check {
        /// Reference; unpinned resolves to the latest cached revision
        reference: String,
    },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// List configured remotes in order
    List,
    /// Register a remote
    Add {
        name: String,
        url: String,
        /// Skip TLS certificate verification for this remote
        #[arg(long)]
        insecure: bool,
    },
    /// Unregister a remote and forget it as an origin
    Remove { name: String },
    /// Re-enable a disabled remote
    Enable { name: String },
    /// Keep a remote registered but skip it
    Disable { name: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Usage and argument errors exit with 1
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::from(1),
            };
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> quarry::Result<()> {
    match cli.command {
        Commands::Install {
            target,
            update,
            remote,
            settings,
            json,
        } => install(&cli.cache_root, &target, update, remote, &settings, json),
        Commands::Export { path, reference } => {
            let ctx = Context::new(&cli.cache_root)?;
            let base = RecipeReference::parse(&reference)?;
            let pinned = ctx.cache.export_recipe(&path, &base)?;
            println!("{}", pinned);
            Ok(())
        }
        Commands::Cache { command } => cache_command(&cli.cache_root, command),
        Commands::Remote { command } => remote_command(&cli.cache_root, command),
    }
}

fn parse_settings(pairs: &[String]) -> quarry::Result<Profile> {
    let mut profile = Profile::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            quarry::Error::ParseError(format!("setting '{}' must look like key=value", pair))
        })?;
        profile.settings.insert(key.to_string(), value.to_string());
    }
    Ok(profile)
}

fn install(
    cache_root: &PathBuf,
    target: &str,
    update: bool,
    remote: Option<String>,
    settings: &[String],
    json: bool,
) -> quarry::Result<()> {
    let profile = parse_settings(settings)?;
    let ctx = Context::new(cache_root)?
        .with_profiles(profile.clone(), profile)
        .with_progress(Arc::new(BarProgress::new("install", 0)));

    let root = if std::path::Path::new(target).is_file() {
        RootSpec::Path(PathBuf::from(target))
    } else {
        let reference = RecipeReference::parse(target)?;
        RootSpec::Virtual(vec![Requirement::new(reference)])
    };

    let options = GraphOptions {
        check_updates: update,
        update,
        selected_remote: remote,
    };
    let mut builder = GraphBuilder::new(&ctx, options);
    let graph = builder.load_graph(root)?;

    if json {
        println!("{}", graph.serialize());
        return Ok(());
    }

    for node in &graph.nodes {
        let Some(reference) = &node.reference else {
            continue;
        };
        println!(
            "{} [{}] {} pkgid={}",
            reference,
            node.context,
            node.status,
            node.package_id.as_deref().unwrap_or("-")
        );
    }
    info!("resolved {} nodes", graph.nodes.len());
    Ok(())
}

fn cache_command(cache_root: &PathBuf, command: CacheCommands) -> quarry::Result<()> {
    let ctx = Context::new(cache_root)?;
    match command {
        CacheCommands::List { all_revisions } => {
            for row in ctx.cache.list_all(!all_revisions)? {
                println!("{}#{}", row.reference, row.rrev);
            }
            Ok(())
        }
        CacheCommands::Remove { reference } => {
            let reference = RecipeReference::parse(&reference)?;
            ctx.cache.remove_recipe(&reference)?;
            println!("Removed {}", reference);
            Ok(())
        }
        CacheCommands::Check { reference } => {
            let mut reference = RecipeReference::parse(&reference)?;
            if reference.revision.is_none() {
                reference = ctx
                    .cache
                    .latest_recipe_revision(&reference)?
                    .ok_or_else(|| quarry::Error::DoesNotExist(reference.base_str()))?;
            }
            ctx.cache.verify_recipe(&reference)?;
            println!("OK {}", reference);
            Ok(())
        }
    }
}

fn remote_command(cache_root: &PathBuf, command: RemoteCommands) -> quarry::Result<()> {
    let mut ctx = Context::new(cache_root)?;
    match command {
        RemoteCommands::List => {
            for remote in ctx.registry.all() {
                let disabled = if remote.disabled { ", Disabled: True" } else { "" };
                println!(
                    "{}: {} [Verify SSL: {}{}]",
                    remote.name, remote.url, remote.verify_ssl, disabled
                );
            }
            return Ok(());
        }
        RemoteCommands::Add { name, url, insecure } => {
            let mut remote = Remote::new(name, url)?;
            remote.verify_ssl = !insecure;
            ctx.registry.add(remote)?;
        }
        RemoteCommands::Remove { name } => {
            ctx.registry.remove(&name)?;
            let cleared = ctx.cache.clear_remote(&name)?;
            if cleared > 0 {
                info!("forgot '{}' as origin of {} cached references", name, cleared);
            }
        }
        RemoteCommands::Enable { name } => ctx.registry.set_disabled(&name, false)?,
        RemoteCommands::Disable { name } => ctx.registry.set_disabled(&name, true)?,
    }
    ctx.save_registry()
}
