// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

const DEFAULT_DB_PATH: &str = "/var/lib/packforge/packforge.db";

fn engine_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("db_path")
            .short('d')
            .long("db-path")
            .value_name("PATH")
            .default_value(DEFAULT_DB_PATH)
            .help("Database path"),
    )
    .arg(
        Arg::new("root")
            .short('r')
            .long("root")
            .default_value("/")
            .help("Install root directory"),
    )
    .arg(
        Arg::new("work_dir")
            .short('w')
            .long("work-dir")
            .help("Directory for downloads and extracted archives"),
    )
    .arg(
        Arg::new("cache_dir")
            .long("cache-dir")
            .help("Cache directory flushed after each finished run"),
    )
    .arg(
        Arg::new("language")
            .short('l')
            .long("language")
            .default_value("en")
            .help("Preferred language for package names"),
    )
    .arg(
        Arg::new("base_package")
            .long("base-package")
            .default_value("com.packforge.core")
            .help("Identifier of the base package every package requires"),
    )
}

fn build_cli() -> Command {
    Command::new("packforge")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Packforge Contributors")
        .about("Package installation engine with resumable installation runs")
        .subcommand_required(false)
        .subcommand(
            Command::new("init")
                .about("Initialize the Packforge database")
                .arg(
                    Arg::new("db_path")
                        .short('d')
                        .long("db-path")
                        .value_name("PATH")
                        .default_value(DEFAULT_DB_PATH)
                        .help("Database path"),
                ),
        )
        .subcommand(engine_args(
            Command::new("install")
                .about("Install or update a package from a local archive or an http(s) URL")
                .arg(Arg::new("source").required(true).help("Path or URL of the package archive"))
                .arg(
                    Arg::new("timeout")
                        .short('t')
                        .long("timeout")
                        .help("Give up fetching and extracting after this many seconds"),
                ),
        ))
        .subcommand(engine_args(
            Command::new("uninstall")
                .about("Uninstall a package by identifier or id")
                .arg(Arg::new("package").required(true).help("Package identifier or numeric id")),
        ))
        .subcommand(engine_args(
            Command::new("resume")
                .about("Resume an interrupted or waiting process")
                .arg(
                    Arg::new("process_no")
                        .required(true)
                        .help("Process number printed when the process was created"),
                )
                .arg(
                    Arg::new("input")
                        .short('i')
                        .long("input")
                        .help("JSON file answering the document the process is waiting on"),
                ),
        ))
        .subcommand(engine_args(
            Command::new("discard")
                .about("Drop an unfinished process so its packages can be processed again")
                .arg(
                    Arg::new("process_no")
                        .required(true)
                        .help("Process number printed when the process was created"),
                ),
        ))
        .subcommand(
            Command::new("query")
                .about("Query installed packages and unfinished processes")
                .arg(Arg::new("pattern").help("Package name pattern (optional)"))
                .arg(
                    Arg::new("db_path")
                        .short('d')
                        .long("db-path")
                        .default_value(DEFAULT_DB_PATH),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("packforge.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
