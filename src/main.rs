use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use stackshelf::config::{default_workers, DumpFiles, SiteConfig, TagDepth, Workspace};
use stackshelf::index::DumpIndex;
use stackshelf::pipeline::{Collaborators, Pipeline};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "stackshelf")]
#[command(about = "Turn Stack Exchange dumps into browsable offline sites")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the offline site from a dump directory
    Build(BuildArgs),
    /// Remove pages, index and redirects left by a previous run
    Clean(CleanArgs),
}

#[derive(Args)]
struct BuildArgs {
    /// Directory holding the dump streams (Users, Posts, Tags; plain or .bz2)
    dump_dir: PathBuf,

    /// Host name of the community, e.g. physics.stackexchange.com
    #[arg(long, env = "STACKSHELF_DOMAIN")]
    domain: String,

    /// Working directory for the index, redirect table and output pages
    #[arg(long, env = "STACKSHELF_WORK")]
    work: PathBuf,

    /// Number of render workers (default: half the available cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Questions listed per tag: -1 for all, else a multiple of 100
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    tag_depth: i64,

    /// Leave out questions without answers
    #[arg(long)]
    no_unanswered: bool,

    /// Don't generate user profile pages
    #[arg(long)]
    no_userprofile: bool,

    /// Drop links that leave the offline site
    #[arg(long)]
    no_externallink: bool,

    /// Don't download any images
    #[arg(long)]
    nopic: bool,

    /// Don't download profile pictures
    #[arg(long)]
    no_identicons: bool,

    /// Remove output of a previous run before starting
    #[arg(long, conflicts_with = "resume")]
    clean_previous: bool,

    /// Continue an interrupted run from its last commit
    #[arg(long)]
    resume: bool,
}

#[derive(Args)]
struct CleanArgs {
    /// Working directory of the run to clean
    #[arg(long, env = "STACKSHELF_WORK")]
    work: PathBuf,
}

fn run_build(args: BuildArgs) -> Result<()> {
    let mut config = SiteConfig::new(&args.domain);
    config.workers = args.threads.unwrap_or_else(default_workers);
    config.tag_depth = TagDepth::parse(args.tag_depth)?;
    config.exclude_unanswered = args.no_unanswered;
    config.user_profiles = !args.no_userprofile;
    config.external_links = !args.no_externallink;
    config.images = !args.nopic;
    config.avatars = !args.no_identicons;
    config.validate()?;

    let files = DumpFiles::locate(&args.dump_dir)?;
    let workspace = Workspace::new(&args.work);
    let previous = workspace.has_previous_run();
    if args.resume && !previous {
        bail!("{:?} holds no previous run to resume", args.work);
    }
    if previous && !args.resume {
        if !args.clean_previous {
            if let Ok(Some(manifest)) = DumpIndex::inspect(&workspace.index_dir()) {
                info!(completed = ?manifest.completed, "Found index of a previous run");
            }
            bail!(
                "{:?} holds output of a previous run; pass --resume, --clean-previous or run `stackshelf clean`",
                args.work
            );
        }
        workspace.clean()?;
    }

    let start = Instant::now();
    let collaborators = Collaborators::defaults(&workspace);
    let mut pipeline = if args.resume {
        Pipeline::resume(config, &workspace, collaborators)?
    } else {
        Pipeline::new(config, &workspace, collaborators)?
    };
    let stats = pipeline.run(&files)?;
    let elapsed = start.elapsed();

    println!();
    println!("=== Summary ===");
    println!("Total time:         {:.2}s", elapsed.as_secs_f64());
    println!();
    println!("Users indexed:      {}", stats.users);
    println!("Questions:          {}", stats.questions);
    println!("Answers:            {}", stats.answers);
    println!("Comments:           {}", stats.comments);
    println!("Excluded:           {}", stats.excluded);
    println!("Malformed records:  {}", stats.malformed);
    println!("Unresolved owners:  {}", stats.unresolved_owners);
    println!("Tag rows:           {}", stats.tag_rows);
    println!("Tags:               {}", stats.tags);
    println!("Tag pages:          {}", stats.tag_pages);
    println!("Redirects:          {}", stats.redirects);
    println!("Pages rendered:     {}", stats.rendered);
    println!("Render failures:    {}", stats.render_failures);
    println!("Images fetched:     {}", stats.images_fetched);
    println!("Image failures:     {}", stats.image_failures);

    Ok(())
}

fn run_clean(args: CleanArgs) -> Result<()> {
    let workspace = Workspace::new(&args.work);
    if !workspace.has_previous_run() {
        info!("Nothing to clean in {:?}", args.work);
        return Ok(());
    }
    workspace.clean()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let result = match cli.command {
        Commands::Build(args) => run_build(args),
        Commands::Clean(args) => run_clean(args),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
