//! The command line interface.

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::partitions::PartitionRoles;
use crate::transaction::{AbSystem, UpgradeError};

/// Exit code signalling "nothing to do": the registry digest equals the
/// booted root's.
const EXIT_NO_UPDATE: i32 = 2;

/// Atomic, image-based updates for immutable Linux systems.
#[derive(Debug, Parser)]
#[clap(name = "abroot", version)]
pub struct Cli {
    /// Increase diagnostic verbosity (-v: info, -vv: debug)
    #[clap(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Stage the latest published image on the inactive root and point
    /// the bootloader at it
    Upgrade,
    /// Check whether a new image is published, without changing anything
    Check,
    /// Show the booted image and the resolved partition roles
    Status,
}

fn run(cli: Cli) -> Result<()> {
    match cli.cmd {
        Cmd::Upgrade => {
            let mut system = AbSystem::new()?;
            system.upgrade()?;
            println!("upgrade complete; the new root becomes active on next boot");
            Ok(())
        }
        Cmd::Check => {
            let system = AbSystem::new()?;
            match system.check_update()? {
                Some(digest) => {
                    println!("update available: {digest}");
                    Ok(())
                }
                None => Err(UpgradeError::NoUpdate.into()),
            }
        }
        Cmd::Status => {
            let system = AbSystem::new()?;
            let current = system.current();
            println!("image:     {}", current.image);
            println!("digest:    {}", current.digest);
            println!("installed: {}", current.timestamp.to_rfc3339());
            let roles = PartitionRoles::resolve(system.config())?;
            println!(
                "present:   {} ({})",
                roles.present.partition.device, roles.present.identified_as
            );
            println!(
                "future:    {} ({})",
                roles.future.partition.device, roles.future.identified_as
            );
            println!("boot:      {}", roles.boot.device);
            Ok(())
        }
    }
}

/// Parse arguments, run, and exit with the documented status codes:
/// 0 on success, 2 when there is no update, 1 on any other failure.
pub fn main() -> ! {
    let cli = Cli::parse();
    let directive = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    abroot_utils::initialize_tracing(directive);

    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) if matches!(e.downcast_ref::<UpgradeError>(), Some(UpgradeError::NoUpdate)) => {
            eprintln!("no update available");
            EXIT_NO_UPDATE
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code)
}
