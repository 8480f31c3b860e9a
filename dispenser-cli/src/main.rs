use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use dispenser_core::rewrite::listing::format_listing;
use dispenser_core::{
    ContainerHandle, ContainerRecord, ContainerType, Dispenser, HostVersion,
    ItemId, JsonFileSettings, MemoryHost, PatchInstaller, PatchTable, Result, Settings,
    StaticRegistry,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dispenser", version, about = "Per-container meal selection for nutrient paste dispensers")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, ClapArgs)]
struct Store {
    /// Host registry exported as JSON.
    #[arg(long)]
    registry: PathBuf,

    /// Settings file. Defaults to Dispenser/settings.json in the user's
    /// config directory.
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List selectable items and their stack multipliers.
    Eligible {
        #[command(flatten)]
        store: Store,
    },
    /// Show every meal with its exclusion state.
    Exclusions {
        #[command(flatten)]
        store: Store,
    },
    /// Toggle whether an item may be selected.
    Exclude {
        #[command(flatten)]
        store: Store,
        item: String,
    },
    /// Set the default item for a container type.
    SetDefault {
        #[command(flatten)]
        store: Store,
        container_type: String,
        item: String,
    },
    ClearDefault {
        #[command(flatten)]
        store: Store,
        container_type: String,
    },
    /// Resolve what a container of the given type would dispense.
    Resolve {
        #[command(flatten)]
        store: Store,
        container_type: String,
        /// Saved choice of the container, as in its save record.
        #[arg(long)]
        meal: Option<String>,
    },
    /// Rewrite the method listings of a host image and print the result.
    Patch {
        /// Host image: version, active packages and method listings.
        host: PathBuf,

        /// Patch table JSON. Defaults to the built-in table.
        #[arg(long)]
        table: Option<PathBuf>,
    },
}

#[derive(Debug, Deserialize)]
struct HostImage {
    version: HostVersion,
    #[serde(default)]
    packages: Vec<String>,
    methods: BTreeMap<String, String>,
}

fn settings_path() -> Option<PathBuf> {
    let mut base = dirs::config_dir().or_else(dirs::data_dir)?;
    base.push("Dispenser");
    base.push("settings.json");
    Some(base)
}

fn open(store: &Store) -> Result<Dispenser<StaticRegistry>> {
    let registry = StaticRegistry::from_json(&fs::read_to_string(&store.registry)?)?;
    let path = store
        .settings
        .clone()
        .or_else(settings_path)
        .unwrap_or_else(|| PathBuf::from("settings.json"));
    let file = JsonFileSettings::new(path);
    let settings = Settings::from_record(file.load()?, &registry);
    Ok(Dispenser::new(registry, settings)?.with_sink(file))
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Eligible { store } => {
            let dispenser = open(&store)?;
            for item in dispenser.eligible_items() {
                match dispenser.quantity_multiplier(&item.id) {
                    Ok(multiplier) => println!("{:<32} x{}  {}", item.id, multiplier, item.label),
                    Err(err) => println!("{:<32} --  {} ({err})", item.id, item.label),
                }
            }
        }
        Command::Exclusions { store } => {
            let dispenser = open(&store)?;
            for entry in dispenser.catalog().exclusion_listing() {
                let mark = match (entry.locked, entry.excluded) {
                    (true, _) => "locked",
                    (false, true) => "excluded",
                    (false, false) => "allowed",
                };
                println!("{:<9} {}", mark, entry.item.id);
            }
        }
        Command::Exclude { store, item } => {
            let mut dispenser = open(&store)?;
            let excluded = dispenser.toggle_excluded(&ItemId::new(item.as_str()))?;
            println!("{item}: {}", if excluded { "excluded" } else { "allowed" });
        }
        Command::SetDefault {
            store,
            container_type,
            item,
        } => {
            let mut dispenser = open(&store)?;
            dispenser.set_default(ContainerType::new(container_type), &ItemId::new(item))?;
        }
        Command::ClearDefault {
            store,
            container_type,
        } => {
            let mut dispenser = open(&store)?;
            if !dispenser.clear_default(&ContainerType::new(container_type.as_str()))? {
                println!("{container_type} had no default");
            }
        }
        Command::Resolve {
            store,
            container_type,
            meal,
        } => {
            let mut dispenser = open(&store)?;
            let container = ContainerHandle::new(0, container_type, true);
            dispenser.restore(
                &container,
                ContainerRecord {
                    meal: meal.map(ItemId::new),
                },
            );
            let resolution = dispenser.resolve(&container)?;
            println!(
                "{} x{} ({:?})",
                resolution.item.id, resolution.multiplier, resolution.source
            );
        }
        Command::Patch { host, table } => {
            let image: HostImage = serde_json::from_str(&fs::read_to_string(&host)?)?;
            let table = match table {
                Some(path) => PatchTable::from_json(&fs::read_to_string(path)?)?,
                None => PatchTable::standard(),
            };
            let mut host = MemoryHost::from_listings(
                image.version,
                image.packages,
                image
                    .methods
                    .iter()
                    .map(|(name, listing)| (name.as_str(), listing.as_str())),
            )?;

            let report = PatchInstaller::default().install_table(&table, &mut host)?;
            for outcome in &report.outcomes {
                println!("{:?} {} {}", outcome.status, outcome.kind, outcome.method);
            }
            for (name, body) in host.methods() {
                println!("\n# {name}");
                print!("{}", format_listing(body));
            }
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(args.command) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
