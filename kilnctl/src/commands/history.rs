use anyhow::{Context, Result};
use clap::Args;
use runner::{Container, ContainerStore, FileStore, HistoryEntry};
use tabled::{settings::style::Style, Table, Tabled};

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Container id or name
    #[arg(value_name = "CONTAINER")]
    pub container: String,

    /// Output machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Tabled)]
struct HistoryRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "CREATED")]
    created: String,
    #[tabled(rename = "CREATED BY")]
    created_by: String,
}

impl HistoryRow {
    fn new(index: usize, entry: &HistoryEntry) -> Self {
        Self {
            index,
            created: entry.created.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            created_by: entry.created_by.clone(),
        }
    }
}

pub fn execute(args: HistoryArgs) -> Result<()> {
    let (env, defaults) = super::load_settings()?;
    let store = FileStore::new(env.storage_root(&defaults));
    let container = store
        .open(&args.container)
        .with_context(|| format!("Failed to open container {}", args.container))?;
    let history = &container.record().history;

    if args.json {
        println!("{}", serde_json::to_string_pretty(history)?);
        return Ok(());
    }

    if history.is_empty() {
        println!("No history recorded for {}", container.record().name);
        return Ok(());
    }

    let rows: Vec<HistoryRow> = history
        .iter()
        .enumerate()
        .map(|(i, entry)| HistoryRow::new(i + 1, entry))
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
    Ok(())
}
