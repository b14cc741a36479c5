// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("sdm")
        .version(env!("CARGO_PKG_VERSION"))
        .author("sdm Contributors")
        .about("Schema and data migration tool for MySQL and MariaDB")
        .subcommand_required(true)
        .subcommand(
            Command::new("init")
                .about("Initialize a migration workspace in the current directory")
                .arg(Arg::new("host").long("host").default_value("127.0.0.1"))
                .arg(Arg::new("port").short('P').long("port").default_value("3306"))
                .arg(Arg::new("user").short('u').long("user").default_value("root"))
                .arg(Arg::new("schema").short('s').long("schema").required(true))
                .arg(Arg::new("author").long("author").default_value("")),
        )
        .subcommand(
            Command::new("add-env")
                .about("Add an environment to the schema applier config")
                .arg(Arg::new("environment").required(true))
                .arg(Arg::new("host").long("host").default_value("127.0.0.1"))
                .arg(Arg::new("port").short('P').long("port").default_value("3306"))
                .arg(Arg::new("user").short('u').long("user").default_value("root")),
        )
        .subcommand(
            Command::new("migrate")
                .about("Apply pending schema and data migrations")
                .arg(Arg::new("environment").required(true))
                .arg(Arg::new("version").short('v').long("version"))
                .arg(Arg::new("name").short('n').long("name"))
                .arg(Arg::new("fake").long("fake").action(ArgAction::SetTrue))
                .arg(Arg::new("dry_run").long("dry-run").action(ArgAction::SetTrue))
                .arg(Arg::new("operator").short('o').long("operator").default_value("")),
        )
        .subcommand(
            Command::new("rollback")
                .about("Roll back to a previously applied version")
                .arg(Arg::new("environment").required(true))
                .arg(Arg::new("version").short('v').long("version").required(true))
                .arg(Arg::new("name").short('n').long("name"))
                .arg(Arg::new("fake").long("fake").action(ArgAction::SetTrue))
                .arg(Arg::new("dry_run").long("dry-run").action(ArgAction::SetTrue))
                .arg(Arg::new("operator").short('o').long("operator").default_value("")),
        )
        .subcommand(
            Command::new("fix")
                .about("Complete or unwind a crashed migration step")
                .arg(Arg::new("direction").required(true).value_parser(["migrate", "rollback"]))
                .arg(Arg::new("environment").required(true))
                .arg(Arg::new("fake").long("fake").action(ArgAction::SetTrue)),
        )
        .subcommand(
            Command::new("make-schema")
                .about("Generate a schema migration plan from schema dir changes")
                .arg(Arg::new("name").required(true))
                .arg(Arg::new("author").long("author").default_value("")),
        )
        .subcommand(
            Command::new("make-data")
                .about("Generate a data migration plan")
                .arg(Arg::new("name").required(true))
                .arg(Arg::new("kind").required(true))
                .arg(Arg::new("author").long("author").default_value("")),
        )
        .subcommand(
            Command::new("make-repeatable")
                .about("Generate a repeatable migration plan")
                .arg(Arg::new("name").required(true))
                .arg(Arg::new("kind").required(true))
                .arg(Arg::new("author").long("author").default_value("")),
        )
        .subcommand(
            Command::new("info")
                .about("Show the migration history of an environment")
                .arg(Arg::new("environment").required(true)),
        )
        .subcommand(
            Command::new("diff")
                .about("Compare schema models, stored versions, or environments")
                .arg(Arg::new("left").required(true))
                .arg(Arg::new("right").required(true))
                .arg(Arg::new("verbose").short('v').long("verbose").action(ArgAction::SetTrue)),
        )
        .subcommand(
            Command::new("pull")
                .about("Overwrite the schema dir from an environment or a stored version")
                .arg(Arg::new("env_or_version").required(true)),
        )
        .subcommand(
            Command::new("check")
                .about("Consistency checks over plans and the schema store")
                .subcommand(
                    Command::new("integrity")
                        .arg(Arg::new("fast").long("fast").action(ArgAction::SetTrue)),
                ),
        )
        .subcommand(
            Command::new("clean")
                .about("Workspace cleanup")
                .subcommand(
                    Command::new("store")
                        .arg(Arg::new("dry_run").long("dry-run").action(ArgAction::SetTrue))
                        .arg(
                            Arg::new("skip_integrity")
                                .long("skip-integrity")
                                .action(ArgAction::SetTrue),
                        ),
                ),
        )
        .subcommand(
            Command::new("test")
                .about("Generate or run migration test plans")
                .subcommand(Command::new("gen").arg(Arg::new("kind").required(true)))
                .subcommand(
                    Command::new("run")
                        .arg(Arg::new("kind").required(true))
                        .arg(Arg::new("environment").required(true)),
                ),
        )
}

fn main() -> std::io::Result<()> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir)?;

    let cmd = build_cli();
    let man = Man::new(cmd.clone());
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    fs::write(man_dir.join("sdm.1"), buffer)?;

    for sub in cmd.get_subcommands() {
        let man = Man::new(sub.clone());
        let mut buffer = Vec::new();
        man.render(&mut buffer)?;
        fs::write(man_dir.join(format!("sdm-{}.1", sub.get_name())), buffer)?;
    }

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
