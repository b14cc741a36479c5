// src/main.rs

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use sdm::engine::{Engine, FixOptions, InitOptions, MigrateOptions, RollbackOptions, WalkOptions};
use sdm::plan::DataChangeKind;
use sdm::project::Project;
use sdm::skeema::SchemaApplier;
use sdm::testplan::TestKind;
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sdm")]
#[command(author, version, about = "Schema and data migration tool for MySQL and MariaDB", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FixDirection {
    Migrate,
    Rollback,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a migration workspace in the current directory
    Init {
        /// MySQL host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// MySQL port
        #[arg(short = 'P', long, default_value = "3306")]
        port: u16,
        /// MySQL user
        #[arg(short, long, default_value = "root")]
        user: String,
        /// Schema to manage
        #[arg(short, long)]
        schema: String,
        /// Author recorded in the initial plan
        #[arg(long, default_value = "")]
        author: String,
    },
    /// Add an environment to the schema applier config
    #[command(visible_alias = "e")]
    AddEnv {
        /// Environment name
        environment: String,
        /// MySQL host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// MySQL port
        #[arg(short = 'P', long, default_value = "3306")]
        port: u16,
        /// MySQL user
        #[arg(short, long, default_value = "root")]
        user: String,
    },
    /// Apply pending schema and data migrations
    #[command(visible_alias = "m")]
    Migrate {
        /// Environment name
        environment: String,
        /// Target version (defaults to the latest plan)
        #[arg(short = 'v', long)]
        version: Option<String>,
        /// Target plan name, to disambiguate versions
        #[arg(short, long)]
        name: Option<String>,
        /// Record history without executing anything
        #[arg(long)]
        fake: bool,
        /// Show what would run without executing
        #[arg(long)]
        dry_run: bool,
        /// Operator recorded in the audit log
        #[arg(short, long, default_value = "")]
        operator: String,
    },
    /// Roll back to a previously applied version
    #[command(visible_alias = "r")]
    Rollback {
        /// Environment name
        environment: String,
        /// Target version to roll back to
        #[arg(short = 'v', long)]
        version: String,
        /// Target plan name, to disambiguate versions
        #[arg(short, long)]
        name: Option<String>,
        /// Record history without executing anything
        #[arg(long)]
        fake: bool,
        /// Show what would run without executing
        #[arg(long)]
        dry_run: bool,
        /// Operator recorded in the audit log
        #[arg(short, long, default_value = "")]
        operator: String,
    },
    /// Complete or unwind a crashed migration step
    Fix {
        /// Direction to resume in
        #[arg(value_enum)]
        direction: FixDirection,
        /// Environment name
        environment: String,
        /// Update history without executing anything
        #[arg(long)]
        fake: bool,
        /// Operator recorded in the audit log
        #[arg(short, long, default_value = "")]
        operator: String,
    },
    /// Generate a schema migration plan from schema dir changes
    #[command(visible_alias = "ms")]
    MakeSchema {
        /// Migration plan name
        name: String,
        /// Author recorded in the plan
        #[arg(long, default_value = "")]
        author: String,
    },
    /// Generate a data migration plan
    #[command(visible_alias = "md")]
    MakeData {
        /// Migration plan name
        name: String,
        /// Change kind: sql, sql_file, python, shell, typescript
        kind: String,
        /// Author recorded in the plan
        #[arg(long, default_value = "")]
        author: String,
    },
    /// Generate a repeatable migration plan
    #[command(visible_alias = "mr")]
    MakeRepeatable {
        /// Migration plan name
        name: String,
        /// Change kind: sql, sql_file, python, shell, typescript
        kind: String,
        /// Author recorded in the plan
        #[arg(long, default_value = "")]
        author: String,
    },
    /// Show the migration history of an environment
    Info {
        /// Environment name
        environment: String,
    },
    /// Compare schema models, stored versions, or environments
    Diff {
        /// Left side: HEAD, <version>, <version>_<name>, or <environment>
        left: String,
        /// Right side: HEAD, <version>, <version>_<name>, or <environment>
        right: String,
        /// Show the full diff instead of a summary
        #[arg(short, long)]
        verbose: bool,
    },
    /// Overwrite the schema dir from an environment or a stored version
    Pull {
        /// <version>, <version>_<name>, or <environment>
        env_or_version: String,
    },
    /// Consistency checks over plans and the schema store
    Check {
        #[command(subcommand)]
        command: CheckCommands,
    },
    /// Workspace cleanup
    Clean {
        #[command(subcommand)]
        command: CleanCommands,
    },
    /// Generate or run migration test plans
    #[command(visible_alias = "t")]
    Test {
        #[command(subcommand)]
        command: TestCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CheckCommands {
    /// Verify plans against the store and the data directory
    Integrity {
        /// Only check file existence instead of recomputing SHA-1s
        #[arg(long)]
        fast: bool,
    },
}

#[derive(Subcommand)]
enum CleanCommands {
    /// Remove unreferenced files from the schema store
    Store {
        /// Only report the files that would be deleted
        #[arg(long)]
        dry_run: bool,
        /// Skip the integrity check before cleaning
        #[arg(long)]
        skip_integrity: bool,
    },
}

#[derive(Args)]
struct WalkArgs {
    /// Walk length for monkey test plans
    #[arg(long)]
    walk_len: Option<usize>,
    /// Start plan (ver_name) for monkey test plans
    #[arg(long, default_value = "")]
    start: String,
    /// Comma-separated plans to visit more often
    #[arg(long, default_value = "")]
    important: String,
    /// Comma-separated plans to visit less often
    #[arg(long, default_value = "")]
    non_important: String,
}

#[derive(Subcommand)]
enum TestCommands {
    /// Generate a test plan file
    Gen {
        /// simple-forward, step-forward, step-forward-backward, or monkey
        kind: String,
        /// Output file
        #[arg(short, long, default_value = "test_plan.json")]
        output: PathBuf,
        #[command(flatten)]
        walk: WalkArgs,
    },
    /// Run a test plan against an environment
    Run {
        /// Test plan type, or custom to read from the input file
        kind: String,
        /// Environment name
        environment: String,
        /// Input file for custom test plans
        #[arg(short, long, default_value = "test_plan.json")]
        input: PathBuf,
        /// Drop every table in the environment first
        #[arg(long)]
        clear: bool,
        #[command(flatten)]
        walk: WalkArgs,
    },
}

impl WalkArgs {
    fn to_options(&self) -> WalkOptions {
        WalkOptions {
            walk_len: self.walk_len,
            start: Some(self.start.clone()),
            important: Some(self.important.clone()),
            non_important: Some(self.non_important.clone()),
        }
    }
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let project = Project::from_cwd()?;

    match cli.command {
        Commands::Init {
            host,
            port,
            user,
            schema,
            author,
        } => {
            Engine::init(
                &project,
                &SchemaApplier::new(),
                &InitOptions {
                    host,
                    port,
                    user,
                    schema,
                    author,
                },
            )?;
            println!("Workspace initialized at: {}", project.root().display());
        }
        Commands::AddEnv {
            environment,
            host,
            port,
            user,
        } => {
            Engine::add_environment(&project, &SchemaApplier::new(), &environment, &host, port, &user)?;
        }
        Commands::Migrate {
            environment,
            version,
            name,
            fake,
            dry_run,
            operator,
        } => {
            let engine = Engine::load(project)?;
            engine.migrate(&MigrateOptions {
                environment,
                version,
                name,
                fake,
                dry_run,
                operator,
            })?;
        }
        Commands::Rollback {
            environment,
            version,
            name,
            fake,
            dry_run,
            operator,
        } => {
            let engine = Engine::load(project)?;
            engine.rollback(&RollbackOptions {
                environment,
                version,
                name,
                fake,
                dry_run,
                operator,
            })?;
        }
        Commands::Fix {
            direction,
            environment,
            fake,
            operator,
        } => {
            let engine = Engine::load(project)?;
            let opts = FixOptions {
                environment,
                fake,
                operator,
            };
            match direction {
                FixDirection::Migrate => engine.fix_migrate(&opts)?,
                FixDirection::Rollback => engine.fix_rollback(&opts)?,
            }
        }
        Commands::MakeSchema { name, author } => {
            let engine = Engine::load(project)?;
            if let Some(path) = engine.make_schema(&name, &author)? {
                println!("Created {}", path.display());
            }
        }
        Commands::MakeData { name, kind, author } => {
            let kind: DataChangeKind = kind.parse()?;
            let engine = Engine::load(project)?;
            let path = engine.make_data(&name, kind, &author)?;
            println!("Created {}", path.display());
        }
        Commands::MakeRepeatable { name, kind, author } => {
            let kind: DataChangeKind = kind.parse()?;
            let engine = Engine::load(project)?;
            let path = engine.make_repeatable(&name, kind, &author)?;
            println!("Created {}", path.display());
        }
        Commands::Info { environment } => {
            let engine = Engine::load(project)?;
            engine.info(&environment)?;
        }
        Commands::Diff {
            left,
            right,
            verbose,
        } => {
            let engine = Engine::load(project)?;
            engine.diff(&left, &right, verbose)?;
        }
        Commands::Pull { env_or_version } => {
            let engine = Engine::load(project)?;
            engine.pull(&env_or_version)?;
        }
        Commands::Check { command } => match command {
            CheckCommands::Integrity { fast } => {
                let engine = Engine::load(project)?;
                engine.check_integrity(fast)?;
                println!("Integrity check passed");
            }
        },
        Commands::Clean { command } => match command {
            CleanCommands::Store {
                dry_run,
                skip_integrity,
            } => {
                let engine = Engine::load(project)?;
                let unexpected = engine.clean_store(dry_run, skip_integrity)?;
                if dry_run && !unexpected.is_empty() {
                    anyhow::bail!(
                        "found {} unexpected files in schema store",
                        unexpected.len()
                    );
                }
            }
        },
        Commands::Test { command } => match command {
            TestCommands::Gen { kind, output, walk } => {
                let kind: TestKind = kind.parse()?;
                let engine = Engine::load(project)?;
                engine.test_gen(kind, &output, &walk.to_options())?;
            }
            TestCommands::Run {
                kind,
                environment,
                input,
                clear,
                walk,
            } => {
                let kind: TestKind = kind.parse()?;
                let engine = Engine::load(project)?;
                engine.test_run(kind, &environment, &input, clear, &walk.to_options())?;
            }
        },
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "sdm", &mut io::stdout());
        }
    }
    Ok(())
}
