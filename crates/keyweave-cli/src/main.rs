//! keyweave CLI
//!
//! Profile validation and inspection tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use keyweave_config::{compile_profile, parse_profile, MacroProfile};

#[derive(Parser, Debug)]
#[command(name = "keyweave")]
#[command(about = "Gesture macro profile tool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a profile file
    Validate {
        /// Path to the profile JSON
        profile: String,
    },

    /// Show a profile's trigger table and compiled key partition
    Inspect {
        /// Path to the profile JSON
        profile: String,
    },

    /// List available input devices
    Devices,
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { profile } => {
            let loaded = load(&profile)?;
            let steps: usize = loaded.bindings.iter().map(|b| b.sequence.len()).sum();
            println!(
                "OK: profile '{}' with {} binding(s), {} step(s)",
                loaded.name,
                loaded.bindings.len(),
                steps
            );
        }

        Commands::Inspect { profile } => {
            let loaded = load(&profile)?;
            let compiled = compile_profile(&loaded);

            println!("Profile: {}", loaded.name);
            if !loaded.description.is_empty() {
                println!("  {}", loaded.description);
            }

            println!("\nBindings:");
            for binding in &loaded.bindings {
                let marker = if binding.enabled { " " } else { "-" };
                println!(
                    " {marker} {:24} {} {} ({} step(s))",
                    binding.name,
                    binding.trigger.key,
                    binding.trigger.gesture,
                    binding.sequence.len()
                );
            }

            let mut conundrum: Vec<String> = compiled
                .conundrum_keys
                .iter()
                .map(ToString::to_string)
                .collect();
            conundrum.sort();
            let mut safe: Vec<String> =
                compiled.safe_keys.iter().map(ToString::to_string).collect();
            safe.sort();
            println!("\nConundrum keys: {}", join_or_none(&conundrum));
            println!("Safe keys:      {}", join_or_none(&safe));
        }

        Commands::Devices => {
            let devices =
                keyweave_daemon::device::discover().map_err(|e| miette::miette!("{e}"))?;
            if devices.is_empty() {
                println!("No input devices found (check permissions on /dev/input)");
            }
            for device in devices {
                let marker = if device.can_capture() { "*" } else { " " };
                println!("{marker} {device}");
            }
        }
    }

    Ok(())
}

fn load(path: &str) -> miette::Result<MacroProfile> {
    let expanded: PathBuf = shellexpand::tilde(path).into_owned().into();
    parse_profile(&expanded).map_err(miette::Report::new)
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}
