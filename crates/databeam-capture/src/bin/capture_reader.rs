//! Offline companion tool: inspect a capture file, dump a topic's messages
//! or infer a union schema.

use anyhow::Result;
use clap::Parser;
use databeam_capture::{infer::infer_schema, CaptureReader};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "capture-reader")]
#[command(about = "Inspect DataBeam capture files", long_about = None)]
struct Cli {
    /// Capture file to read
    path: PathBuf,

    /// Restrict to one topic
    #[arg(long)]
    topic: Option<String>,

    /// Skip messages logged before this timestamp (nanoseconds)
    #[arg(long, default_value_t = 0)]
    start_time: u64,

    /// Print each message as one JSON line
    #[arg(long)]
    dump: bool,

    /// Infer a union schema over the message bodies and print it
    #[arg(long)]
    infer: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.infer {
        let schema = infer_schema(&cli.path, cli.topic.as_deref())?;
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let mut reader = CaptureReader::open(&cli.path)?;
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();

    while let Some(msg) = reader.next_message()? {
        if let Some(topic) = &cli.topic {
            if msg.topic != *topic {
                continue;
            }
        }
        if msg.log_time < cli.start_time {
            continue;
        }
        if cli.dump {
            println!(
                "{} {} {} {}",
                msg.publish_time,
                msg.topic,
                msg.sequence,
                String::from_utf8_lossy(&msg.data)
            );
        }
        *counts.entry(msg.topic).or_insert(0) += 1;
    }

    if !cli.dump {
        for (id, info) in reader.channels() {
            println!(
                "channel {id}: topic={} schema={} messages={}",
                info.topic,
                info.name,
                counts.get(&info.topic).copied().unwrap_or(0)
            );
        }
    }
    Ok(())
}
