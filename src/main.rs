//! Drives checkpoint/migration experiments on remote hosts over SSH. The
//! routine is chosen by subcommand; run with `--help` for the surface.

// Useful common routines and macros.
#[macro_use]
mod common;

mod checkpoint;
mod error;
mod experiment;
mod lazy;
mod logparse;
mod migrate;
mod objstore;
mod remote;
mod telemetry;
mod tracker;
mod transfer;
mod workloads;

fn run() -> Result<(), failure::Error> {
    let matches = clap::App::new("criu-runner")
        .about(
            "Orchestrates process checkpoint-and-migration experiments across two \
             remote hosts: pre-dumps, final dump, transfer, restore, verification, \
             and telemetry collection.",
        )
        .subcommand(migrate::cli_options())
        .setting(clap::AppSettings::SubcommandRequired)
        .setting(clap::AppSettings::DisableVersion)
        .get_matches();

    match matches.subcommand() {
        ("migrate", Some(sub_m)) => migrate::run(sub_m),
        _ => {
            unreachable!();
        }
    }
}

fn main() {
    env_logger::init();

    if let Err(err) = run() {
        // Errors from SSH commands get a friendlier rendering.
        let err = match err.downcast::<spurs::SshError>() {
            Ok(err) => {
                println!(
                    "`criu-runner` encountered the following error while \
                     attempting to run a command over SSH: {}",
                    err
                );
                std::process::exit(1);
            }
            Err(err) => err,
        };

        println!("`criu-runner` encountered the following error: {:?}", err);
        std::process::exit(1);
    }
}
