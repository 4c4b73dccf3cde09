//! Emulator binary - generates synthetic ORCA packets and decodes them
//!
//! Usage:
//!   cargo run --bin emulator                              # SIS3302 with defaults
//!   cargo run --bin emulator -- --config emulator.toml    # Use config file
//!   cargo run --bin emulator -- -m gretina4m --ft-len 200 # Multisampled Gretina4M
//!   cargo run --bin emulator -- -n 10 -o tables.json      # Dump decoded tables

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use clap::Parser;
use orca_digitizers::common::EmulatorArgs;
use orca_digitizers::config::ObjectInfo;
use orca_digitizers::data_source_emulator::{Emulator, EmulatorConfig};
use orca_digitizers::decoder::{ChannelKey, DecoderRegistry, PacketView, TableSet};
use orca_digitizers::table::{OutputTable, Table};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize tracing (logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("orca_digitizers=info".parse()?),
        )
        .init();

    let args = EmulatorArgs::parse();

    // Build configuration
    let config_path = &args.common.config_file;
    let config = if Path::new(config_path).exists() {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading {}", config_path))?;
        let config: EmulatorConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", config_path))?;
        info!(config_file = %config_path, "Loaded configuration");
        config
    } else {
        EmulatorConfig::default()
    };
    let config = args.apply(config);

    let emulator = Emulator::new(config.clone())?;
    let object_info = match &args.object_info {
        Some(path) => ObjectInfo::load(path).with_context(|| format!("loading {}", path))?,
        None => emulator.object_info(),
    };

    let id = config.model.decoder_id();
    let mut decoder = DecoderRegistry::new()
        .create(id.decoder_name, id.orca_class_name)
        .with_context(|| format!("no decoder registered for {}", id.decoder_name))?;
    decoder.set_object_info(&object_info)?;

    let mut tables: BTreeMap<ChannelKey, Table> = decoder
        .schemas()
        .iter()
        .map(|(key, schema)| (*key, Table::with_capacity(schema, args.events)))
        .collect();

    println!(
        "Decoding {} {} packets into {} tables",
        args.events,
        decoder.decoder_name(),
        tables.len()
    );

    for (packet_id, packet) in emulator.take(args.events).enumerate() {
        decoder.decode_packet(
            &PacketView::new(&packet),
            &mut TableSet::PerChannel(&mut tables),
            packet_id as u32,
            None,
        )?;
    }

    for (key, table) in &tables {
        println!("  channel {}: {} rows", key, table.loc());
    }
    for (key, count) in decoder.skipped_channels().iter() {
        println!("  channel {}: {} packets skipped (no table)", key, count);
    }
    println!("Events decoded: {}", decoder.events_decoded());

    if let Some(output) = &args.output {
        let dump: serde_json::Map<String, serde_json::Value> = tables
            .iter()
            .map(|(key, table)| (key.raw().to_string(), table.to_json()))
            .collect();
        let dump = serde_json::Value::Object(dump);
        let bytes = if output.ends_with(".msgpack") {
            rmp_serde::to_vec_named(&dump)?
        } else {
            serde_json::to_vec_pretty(&dump)?
        };
        std::fs::write(output, bytes).with_context(|| format!("writing {}", output))?;
        info!(output = %output, "Wrote decoded tables");
    }

    Ok(())
}
