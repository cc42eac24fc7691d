//! Query command implementation.

use anyhow::{Context, Result};
use console::style;
use pblflash::Response;

use crate::config::Config;
use crate::{Cli, open_flasher, product_id};

fn hex_word(word: u16) -> String {
    format!("0x{word:04X}")
}

/// Query report as JSON.
fn report_json(response: &Response) -> serde_json::Value {
    let area = response.config_area();
    serde_json::json!({
        "loader_words": response.loader_words,
        "app_words": response.app_words,
        "product_id": hex_word(response.product_id),
        "boot_version": response.boot_version,
        "protocol": response.protocol,
        "user_id": area.user.map(hex_word),
        "device_id": hex_word(area.device_id),
        "config1": hex_word(area.config1),
        "config2": hex_word(area.config2),
        "config": response.config.map(hex_word),
    })
}

fn print_report(response: &Response, expected_product: u16) {
    let area = response.config_area();

    eprintln!("\n{}", style("Bootloader").bold().underlined());
    eprintln!("  Loader size:      {} words", response.loader_words);
    eprintln!(
        "  Application size: {} words (base {})",
        response.app_words,
        hex_word(response.loader_words)
    );
    if response.product_id == expected_product {
        eprintln!("  Product ID:       {}", hex_word(response.product_id));
    } else {
        eprintln!(
            "  Product ID:       {} {}",
            hex_word(response.product_id),
            style(format!("(expected {})", hex_word(expected_product))).yellow()
        );
    }
    eprintln!("  Boot version:     {}", response.boot_version);
    eprintln!("  Protocol:         {}", response.protocol);

    eprintln!("\n{}", style("Configuration").bold().underlined());
    for (i, word) in area.user.iter().enumerate() {
        eprintln!("  User ID {}:        {}", i + 1, hex_word(*word));
    }
    eprintln!("  Device ID:        {}", hex_word(area.device_id));
    eprintln!("  Config 1:         {}", hex_word(area.config1));
    eprintln!("  Config 2:         {}", hex_word(area.config2));
}

/// Query the bootloader and print what it reports.
pub(crate) fn cmd_query(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let mut flasher = open_flasher(cli, config)?;
    let response = flasher
        .query()
        .context("bootloader did not answer the query")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(&response))?);
    } else {
        print_report(&response, product_id(cli, config));
    }
    Ok(())
}
