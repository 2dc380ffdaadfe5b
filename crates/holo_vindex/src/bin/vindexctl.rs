//! Operator tool for inspecting keyspace ids and vschema declarations.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_vindex::vindex::NoStoreCursor;
use holo_vindex::{vhash, vunhash, Registry, VSchema, Value, VindexEnv, VindexSettings};

#[derive(Parser)]
#[command(name = "vindexctl")]
#[command(about = "Inspect keyspace ids and vindex declarations", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the keyspace id (hex) of an unsigned value.
    Hash { value: u64 },
    /// Print the value behind a hex keyspace id.
    Unhash { ksid: String },
    /// List the vindexes declared in a vschema file.
    Describe {
        #[arg(long, env = "HOLO_VINDEX_VSCHEMA")]
        vschema: PathBuf,
    },
    /// Resolve values through a functional vindex.
    Map {
        #[arg(long, env = "HOLO_VINDEX_VSCHEMA")]
        vschema: PathBuf,
        #[arg(long)]
        vindex: String,
        /// Values to resolve; `null`, integers or text.
        #[arg(required = true)]
        values: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "holo_vindex=info,warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::Hash { value } => {
            println!("{}", hex::encode(vhash(value)));
        }
        Command::Unhash { ksid } => {
            let raw = ksid.trim();
            let bytes = hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
                .with_context(|| format!("invalid hex keyspace id: {ksid}"))?;
            println!("{}", vunhash(&bytes)?);
        }
        Command::Describe { vschema } => {
            let registry = registry()?;
            let set = load(&vschema)?.build(&registry)?;
            println!("{:<24} {:<28} {:>4} {:>6} {:>10}", "NAME", "TYPE", "COST", "UNIQUE", "FUNCTIONAL");
            for (name, vindex) in set.iter() {
                println!(
                    "{:<24} {:<28} {:>4} {:>6} {:>10}",
                    name,
                    vindex.kind(),
                    vindex.cost(),
                    vindex.is_unique(),
                    vindex.is_functional()
                );
            }
        }
        Command::Map {
            vschema,
            vindex,
            values,
        } => {
            let registry = registry()?;
            let set = load(&vschema)?.build(&registry)?;
            let target = set
                .get(&vindex)
                .with_context(|| format!("vindex {vindex} is not declared"))?;
            if target.needs_vcursor() {
                anyhow::bail!("vindex {vindex} needs a backing store; only functional vindexes can be mapped offline");
            }
            let resolver = target
                .as_single_column()
                .with_context(|| format!("vindex {vindex} does not map single columns"))?;
            let ids: Vec<Value> = values.iter().map(|raw| Value::parse_literal(raw)).collect();
            let destinations = resolver.map(&NoStoreCursor, &ids).await?;
            for (id, destination) in ids.iter().zip(destinations) {
                println!("{id}\t{destination}");
            }
        }
    }
    Ok(())
}

fn registry() -> anyhow::Result<Registry> {
    let settings = VindexSettings::from_env()?;
    Ok(Registry::new(VindexEnv::from_settings(settings)))
}

fn load(path: &Path) -> anyhow::Result<VSchema> {
    VSchema::load(path).with_context(|| format!("failed to load vschema {}", path.display()))
}
