//! Flash and run command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use pblflash::{
    Image, Memory, Source,
    flasher::{Finish, FlashOptions, check_device},
};
use std::path::PathBuf;

use crate::config::Config;
use crate::{Cli, CliError, open_flasher, product_id, use_fancy_output, was_interrupted};

/// Flags of the flash subcommand.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FlashArgs {
    pub eeprom: bool,
    pub check: bool,
    pub execute: bool,
    pub reset: bool,
}

impl FlashArgs {
    /// Combine flags with config defaults. EEPROM loads ignore the defaults.
    fn options(self, config: &Config) -> FlashOptions {
        if self.eeprom {
            return FlashOptions::default().with_finish(if self.reset {
                Finish::Reset
            } else {
                Finish::Stay
            });
        }
        let finish = if self.reset {
            Finish::Reset
        } else if self.execute || config.flash.execute {
            Finish::Execute
        } else {
            Finish::Stay
        };
        FlashOptions::default()
            .with_check(self.check || config.flash.check)
            .with_finish(finish)
    }
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Turn a library interruption into a cancellation.
fn cancelled_on_interrupt(err: pblflash::Error) -> anyhow::Error {
    match err {
        pblflash::Error::Interrupted => {
            CliError::Cancelled("interrupted between rows".to_string()).into()
        },
        err => err.into(),
    }
}

fn progress_bar(quiet: bool, rows: usize) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(rows as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} rows {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    file: Option<&PathBuf>,
    args: &FlashArgs,
) -> Result<()> {
    let path = file
        .or(config.flash.file.as_ref())
        .ok_or_else(|| {
            CliError::Usage("no image file given; pass one or set flash.file".to_string())
        })?;
    if args.eeprom && (config.flash.check || config.flash.execute) {
        warn!("Ignoring check/execute defaults for an EEPROM image");
    }
    let options = args.options(config);

    let mut flasher = open_flasher(cli, config)?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!("{} Waiting for bootloader...", style("⏳").yellow());
    }
    let response = flasher
        .query()
        .context("bootloader did not answer the query")?;
    check_device(&response, product_id(cli, config))?;
    if !cli.quiet {
        eprintln!(
            "{} Bootloader found: product {:#06x}, {} application words",
            style("✓").green(),
            response.product_id,
            response.app_words
        );
    }

    let memory = if args.eeprom {
        Memory::Eeprom
    } else {
        Memory::Program
    };
    let source = Source::from_file(path, &response, memory)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let image = if args.eeprom {
        Image::eeprom(&source)?
    } else {
        Image::program(&source, &response)?
    };
    if !cli.quiet {
        eprintln!(
            "{} {} ({} rows)",
            style("📦").cyan(),
            path.display(),
            image.rows().len()
        );
    }
    ensure_not_interrupted()?;

    let pb = progress_bar(cli.quiet, image.rows().len());
    let result = flasher.flash(&image, options, |row, _| pb.set_position(row as u64));
    match result {
        Ok(()) => pb.finish_with_message("done"),
        Err(err) => {
            pb.abandon();
            return Err(cancelled_on_interrupt(err)).context("flashing failed");
        },
    }

    if !cli.quiet {
        let finished = match options.finish {
            Finish::Execute => "application started",
            Finish::Reset => "device reset",
            Finish::Stay => "device left in the bootloader",
        };
        eprintln!(
            "\n{} Flash completed, {finished}",
            style("🎉").green().bold()
        );
    }
    Ok(())
}

/// Run command implementation: verify and start the resident application.
pub(crate) fn cmd_run(cli: &Cli, config: &Config) -> Result<()> {
    let mut flasher = open_flasher(cli, config)?;
    ensure_not_interrupted()?;

    let response = flasher
        .query()
        .context("bootloader did not answer the query")?;
    check_device(&response, product_id(cli, config))?;

    flasher
        .run_application()
        .context("cannot start the application")?;
    if !cli.quiet {
        eprintln!("{} Application started", style("✓").green());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_flags() {
        let config = Config::default();
        let options = FlashArgs {
            check: true,
            ..Default::default()
        }
        .options(&config);
        assert!(options.check);
        assert_eq!(options.finish, Finish::Stay);

        let options = FlashArgs {
            execute: true,
            ..Default::default()
        }
        .options(&config);
        assert_eq!(options.finish, Finish::Execute);

        let options = FlashArgs {
            reset: true,
            ..Default::default()
        }
        .options(&config);
        assert_eq!(options.finish, Finish::Reset);
    }

    #[test]
    fn test_options_from_config_defaults() {
        let mut config = Config::default();
        config.flash.check = true;
        config.flash.execute = true;

        let options = FlashArgs::default().options(&config);
        assert!(options.check);
        assert_eq!(options.finish, Finish::Execute);

        // An explicit reset wins over the execute default.
        let options = FlashArgs {
            reset: true,
            ..Default::default()
        }
        .options(&config);
        assert_eq!(options.finish, Finish::Reset);
    }

    #[test]
    fn test_eeprom_ignores_config_defaults() {
        let mut config = Config::default();
        config.flash.check = true;
        config.flash.execute = true;

        let options = FlashArgs {
            eeprom: true,
            ..Default::default()
        }
        .options(&config);
        assert!(!options.check);
        assert_eq!(options.finish, Finish::Stay);
    }

    #[test]
    fn test_interrupt_maps_to_cancelled() {
        let err = cancelled_on_interrupt(pblflash::Error::Interrupted);
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Cancelled(_))
        ));

        let err = cancelled_on_interrupt(pblflash::Error::IntegrityCheckFailed);
        assert!(err.downcast_ref::<CliError>().is_none());
    }
}
