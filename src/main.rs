//! docbridge CLI - SQL over document collections

use clap::{Parser, Subcommand};
use docbridge::store::{loader, MemoryStore};
use docbridge::{Cell, ConnectionConfig, Engine, EngineConfig, Error, ExecuteResult, Params, ResultCursor};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docbridge")]
#[command(about = "Run SQL against a directory of JSON document collections", long_about = None)]
struct Cli {
    /// Directory of *.json / *.jsonl collections
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Connection URL; its database and driver options override the config file
    #[arg(short, long)]
    url: Option<String>,

    /// YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a statement
    Query {
        sql: String,
        /// Parameter value: `name=value` binds `:name`, a bare value binds the next `?`
        #[arg(short, long = "param")]
        params: Vec<String>,
    },

    /// Show the store operations of a statement
    Explain {
        sql: String,
        #[arg(short, long = "param")]
        params: Vec<String>,
    },

    /// Start interactive REPL mode
    Repl,

    /// List collections
    Tables,

    /// Show the synthesized schema of a collection
    Schema {
        collection: String,
        /// Documents to sample
        #[arg(long)]
        sample: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(url) = &cli.url {
        config = ConnectionConfig::parse(url, &BTreeMap::new())?.apply(config)?;
    }
    if let Commands::Schema { sample: Some(n), .. } = &cli.command {
        config.sample_size = Some(*n);
    }

    let engine = open_engine(cli.data.as_ref(), config).await?;

    match cli.command {
        Commands::Query { sql, params } => execute_query(&engine, &sql, &parse_params(&params)),
        Commands::Explain { sql, params } => explain_query(&engine, &sql, &parse_params(&params)),
        Commands::Repl => run_repl(&engine),
        Commands::Tables => list_tables(&engine),
        Commands::Schema { collection, .. } => show_schema(&engine, &collection),
    }
}

async fn open_engine(data: Option<&PathBuf>, config: EngineConfig) -> anyhow::Result<Engine> {
    let store = Arc::new(MemoryStore::new());
    if let Some(dir) = data {
        let loaded = loader::load_dir(&store, &config.database, dir).await?;
        tracing::info!(documents = loaded, dir = %dir.display(), "Loaded data directory");
    }
    Ok(Engine::new(store, config))
}

/// `name=value` binds a named parameter, anything else the next positional one
fn parse_params(args: &[String]) -> Params {
    args.iter().fold(Params::new(), |params, arg| {
        match arg.split_once('=') {
            Some((name, value)) if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') => {
                params.bind(name, parse_value(value))
            }
            _ => params.push(parse_value(arg)),
        }
    })
}

fn parse_value(text: &str) -> Cell {
    if text.eq_ignore_ascii_case("null") {
        Cell::Null
    } else if let Ok(b) = text.parse::<bool>() {
        Cell::Boolean(b)
    } else if let Ok(i) = text.parse::<i64>() {
        Cell::Integer(i)
    } else if let Ok(f) = text.parse::<f64>() {
        Cell::Float(f)
    } else {
        Cell::String(text.to_string())
    }
}

fn report(err: Error) -> anyhow::Error {
    if let Some(suggestion) = err.suggestion() {
        eprintln!("Hint: {}", suggestion);
    }
    err.into()
}

fn execute_query(engine: &Engine, sql: &str, params: &Params) -> anyhow::Result<()> {
    match engine.execute(sql, params).map_err(report)? {
        ExecuteResult::Rows(cursor) => print_rows(cursor),
        ExecuteResult::UpdateCount(n) => {
            println!("{} document(s) affected.", n);
            Ok(())
        }
    }
}

fn explain_query(engine: &Engine, sql: &str, params: &Params) -> anyhow::Result<()> {
    let plan = engine.explain(sql, params).map_err(report)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn print_rows(mut cursor: ResultCursor) -> anyhow::Result<()> {
    let rows = cursor.collect_rows().map_err(Error::from).map_err(report)?;
    let header: Vec<String> = cursor.columns().iter().map(|c| c.name.clone()).collect();
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.cells().iter().map(Cell::to_string).collect())
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in &body {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |cells: &[String]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect();
        println!("| {} |", padded.join(" | "));
    };
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();

    line(&header);
    println!("|-{}-|", rule.join("-|-"));
    for row in &body {
        line(row);
    }
    println!("({} row(s))", body.len());
    Ok(())
}

fn run_repl(engine: &Engine) -> anyhow::Result<()> {
    use std::io::{self, BufRead, Write};

    println!("docbridge Interactive Shell");
    println!("Database: {}", engine.config().database);
    println!("Type 'help' for commands, 'exit' to quit.");
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("dsql> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.to_lowercase().as_str() {
            "exit" | "quit" | "\\q" => break,
            "help" | "\\h" => {
                println!("Commands:");
                println!("  SELECT ... FROM <collection>   - Query documents");
                println!("  INSERT INTO <collection> ...   - Insert documents");
                println!("  UPDATE <collection> SET ...    - Update documents");
                println!("  DELETE FROM <collection> ...   - Delete documents");
                println!("  db.<collection>.find(...)      - Shell commands");
                println!();
                println!("Special:");
                println!("  \\d            - List collections");
                println!("  \\d <name>     - Describe a collection");
                println!("  \\x <sql>      - Explain a statement");
                println!("  help, \\h      - Show this help");
                println!("  exit, \\q      - Exit the shell");
                continue;
            }
            _ => {}
        }

        let result = if line == "\\d" {
            list_tables(engine)
        } else if let Some(collection) = line.strip_prefix("\\d ") {
            show_schema(engine, collection.trim())
        } else if let Some(sql) = line.strip_prefix("\\x ") {
            explain_query(engine, sql, &Params::new())
        } else {
            execute_query(engine, line, &Params::new())
        };
        if let Err(e) = result {
            println!("Error: {}", e);
        }
        println!();
    }

    println!("Goodbye!");
    Ok(())
}

fn list_tables(engine: &Engine) -> anyhow::Result<()> {
    let tables = engine.list_tables()?;
    if tables.is_empty() {
        println!("No collections found.");
        return Ok(());
    }
    println!("Collections:");
    for table in tables {
        println!("  {}", table);
    }
    Ok(())
}

fn show_schema(engine: &Engine, collection: &str) -> anyhow::Result<()> {
    let schema = engine.describe_table(collection).map_err(report)?;
    println!("{} ({} document(s) sampled)", schema.collection, schema.sampled);
    for column in &schema.columns {
        let mut flags = Vec::new();
        if column.primary_key {
            flags.push("PRIMARY KEY".to_string());
        }
        if !column.nullable {
            flags.push("NOT NULL".to_string());
        }
        if let Some(kind) = column.native_kind {
            flags.push(format!("stored as {}", kind));
        }
        println!(
            "  {:>3}  {:<24} {:<10} {}",
            column.ordinal,
            column.name,
            column.canonical_type.sql_type_name(),
            flags.join(", ")
        );
    }
    Ok(())
}
