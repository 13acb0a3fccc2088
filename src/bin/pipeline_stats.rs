use anyhow::Result;
use clap::Parser;
use prettytable::{Cell, Row as PrettyRow, Table};

use newsroom::db::Database;
use newsroom::resolver::verify_primary_invariant;

#[derive(Parser)]
#[clap(name = "pipeline-stats", about = "Show row counts per pipeline stage")]
struct Cli {
    /// SQLite database file
    #[clap(long, env = "DATABASE_PATH", default_value = "newsroom.db")]
    database_path: String,

    /// Also check that every resolved article points at a primary
    #[clap(short, long)]
    verify: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let db = Database::new(&args.database_path).await?;

    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Table"),
        Cell::new("Status"),
        Cell::new("Rows"),
    ]));
    for (table_name, status, count) in db.collect_stats().await? {
        table.add_row(PrettyRow::new(vec![
            Cell::new(&table_name),
            Cell::new(&status),
            Cell::new(&count.to_string()),
        ]));
    }
    table.printstd();

    if args.verify {
        let violations = verify_primary_invariant(&db).await?;
        if violations.is_empty() {
            println!("Primary pointers: ok");
        } else {
            println!("Primary pointers: {} broken ({:?})", violations.len(), violations);
        }
    }

    Ok(())
}
