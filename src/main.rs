use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use media_batch::config::AppConfig;
use media_batch::models::profile::ProfileStatus;
use media_batch::services::data_source::{DataSource, ManifestSource};
use media_batch::services::profiles::{assign_profiles, ProfileRegistry};
use media_batch::services::validation;

#[derive(Parser, Debug)]
#[command(name = "media-batch", version, about = "Batch media generation over authenticated profiles")]
struct Cli {
    /// Profile storage root (overrides MEDIA_BATCH_PROFILES_DIR)
    #[arg(long, global = true)]
    profiles_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage browser profiles
    #[command(subcommand)]
    Profiles(ProfileCommands),

    /// Inspect job manifests
    #[command(subcommand)]
    Jobs(JobCommands),

    /// Show which profile each worker would be bound to
    Plan {
        /// Requested worker count (defaults to MEDIA_BATCH_MAX_THREADS)
        #[arg(short, long)]
        threads: Option<usize>,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileCommands {
    /// List profiles and their status
    List,

    /// Reconcile recorded profiles with the directories on disk
    Scan,

    /// Create storage for a new profile
    Create { name: String },

    /// Delete a profile and its session storage
    Delete { name: String },

    /// Record a profile's authentication status
    Mark {
        name: String,
        /// unknown, authenticated, unauthenticated, needs_reauth or checking
        status: ProfileStatus,
        #[arg(short, long, default_value = "")]
        message: String,
    },
}

#[derive(Subcommand, Debug)]
enum JobCommands {
    /// Print the payloads a manifest yields and where their artifacts would land
    Inspect {
        manifest: PathBuf,
        #[arg(long, default_value = "images")]
        image_dir: PathBuf,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Include rows already marked as completed
        #[arg(long)]
        all: bool,
    },

    /// Write a sample manifest
    Template { path: PathBuf },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    metrics::describe_counter!("generation_jobs_total", "Total generation jobs submitted");
    metrics::describe_counter!("generation_jobs_completed", "Generation jobs completed");
    metrics::describe_counter!("generation_jobs_failed", "Generation jobs that failed");
    metrics::describe_counter!("generation_jobs_cancelled", "Generation jobs cancelled before start");
    metrics::describe_histogram!("generation_job_seconds", "Time spent running one generation job");
    metrics::describe_gauge!("generation_queue_depth", "Messages waiting in the job queue");

    if let Err(e) = run(Cli::parse()) {
        tracing::error!(error = %e, "Command failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::from_env()?;
    if let Some(dir) = cli.profiles_dir {
        config.profiles_dir = dir;
    }

    match cli.command {
        Command::Profiles(cmd) => handle_profile_command(cmd, &config),
        Command::Jobs(cmd) => handle_job_command(cmd, &config),
        Command::Plan { threads } => {
            let registry = ProfileRegistry::open(&config.profiles_dir)?;
            let authenticated = registry.authenticated_profiles();
            let requested = threads.unwrap_or(config.max_threads);
            let bindings = assign_profiles(&authenticated, requested);
            if bindings.is_empty() {
                println!("No authenticated profiles; the pool cannot start.");
                return Ok(());
            }
            println!(
                "{} worker(s) ({requested} requested, {} authenticated)",
                bindings.len(),
                authenticated.len()
            );
            for binding in bindings {
                println!("  Worker #{} -> {}", binding.worker_id, binding.profile.name);
            }
            Ok(())
        }
    }
}

fn handle_profile_command(
    cmd: ProfileCommands,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = ProfileRegistry::open(&config.profiles_dir)?;

    match cmd {
        ProfileCommands::List => print_profiles(&registry),
        ProfileCommands::Scan => {
            registry.scan()?;
            print_profiles(&registry);
        }
        ProfileCommands::Create { name } => {
            if registry.create_profile(&name)? {
                println!("Created profile {name}; sign in, then mark it authenticated.");
            } else {
                println!("Profile {name} already exists.");
            }
        }
        ProfileCommands::Delete { name } => {
            if registry.delete_profile(&name)? {
                println!("Deleted profile {name}.");
            } else {
                println!("No profile named {name}.");
            }
        }
        ProfileCommands::Mark { name, status, message } => {
            if registry.set_status(&name, status, &message)? {
                println!("{name}: {status}");
            } else {
                println!("No profile named {name}.");
            }
        }
    }
    Ok(())
}

fn print_profiles(registry: &ProfileRegistry) {
    let profiles = registry.all();
    if profiles.is_empty() {
        println!("No profiles under {}", registry.root().display());
    }
    for profile in profiles {
        let last_used = profile
            .last_used
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<20} {:<16} last used {:<16} {}",
            profile.name,
            profile.status.to_string(),
            last_used,
            profile.error_message
        );
    }
}

fn handle_job_command(cmd: JobCommands, config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        JobCommands::Inspect {
            manifest,
            image_dir,
            output_dir,
            all,
        } => {
            let output_dir = output_dir.unwrap_or_else(|| config.download_dir.clone());
            let source = ManifestSource::open(&manifest, image_dir, output_dir)?;
            let payloads = source.load_jobs(!all)?;
            println!("{} job(s) in {}", payloads.len(), manifest.display());
            for (position, payload) in payloads.iter().enumerate() {
                let row = payload.source_ref.as_deref().unwrap_or("-");
                println!("\n[row {row}] {} x{}", payload.media_type, payload.variations);
                println!("  prompt: {}", payload.prompt);
                for reference in &payload.reference_images {
                    println!("  reference: {}", reference.display());
                }
                let job_id = position as u64 + 1;
                for path in validation::variation_paths(payload, job_id, &config.download_dir) {
                    println!("  -> {}", path.display());
                }
            }
        }
        JobCommands::Template { path } => {
            ManifestSource::write_template(&path)?;
            println!("Wrote sample manifest to {}", path.display());
        }
    }
    Ok(())
}
