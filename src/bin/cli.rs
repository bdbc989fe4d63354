use clap::{Parser, Subcommand, ValueEnum};
use futures::TryStreamExt;
use serde::Serialize;
use serde_json::Value;
use std::process::ExitCode;
use tabled::builder::Builder;
use tabled::{settings::Style, Table, Tabled};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bqdriver::config::DEFAULT_DATA_SOURCE;
use bqdriver::error::{BigQueryError, DriverError};
use bqdriver::{BigQueryDriver, ColumnType, DriverConfig, Row, UnloadOptions, UnloadQuery};

#[derive(Parser)]
#[command(name = "bqdriver")]
#[command(about = "Run BigQuery jobs, inspect result types and unload to GCS")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data source whose CUBEJS_* variables configure the driver
    #[arg(short, long, default_value = DEFAULT_DATA_SOURCE)]
    data_source: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Run `SELECT ? AS number` to verify credentials
    TestConnection,

    /// Execute a query and print its rows
    Query {
        sql: String,

        /// Positional parameter, repeatable
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Read rows through the streaming channel
        #[arg(long)]
        stream: bool,
    },

    /// Resolve the column types of a query
    Types { sql: String },

    /// Read the column types of a table (dataset.table)
    TableTypes { table: String },

    /// List tables in a dataset
    Tables { dataset: String },

    /// Print every visible column grouped by dataset and table
    Schema,

    /// Export a table or query to the export bucket and print signed URLs
    Unload {
        /// Destination name (dataset.table)
        table: String,

        /// Export this query instead of the table contents
        #[arg(long)]
        sql: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Yaml,
    Json,
}

#[derive(Tabled, Serialize)]
struct TypeRow {
    name: String,
    #[tabled(rename = "type")]
    #[serde(rename = "type")]
    generic_type: String,
}

impl From<&ColumnType> for TypeRow {
    fn from(column: &ColumnType) -> Self {
        Self {
            name: column.name.clone(),
            generic_type: column.generic_type.to_string(),
        }
    }
}

#[derive(Tabled, Serialize)]
struct SchemaRow {
    dataset: String,
    table: String,
    column: String,
    #[tabled(rename = "type")]
    #[serde(rename = "type")]
    data_type: String,
    generic: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("bqdriver=debug,info")
    } else {
        EnvFilter::new("bqdriver=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(e);
            ExitCode::FAILURE
        }
    }
}

fn print_error(err: Box<dyn std::error::Error>) {
    if let Some(DriverError::BigQuery(bq)) = err.downcast_ref::<DriverError>() {
        print_bq_error(bq);
        return;
    }

    eprintln!("\x1b[31m✗ Error:\x1b[0m {}", err);
}

fn print_bq_error(err: &BigQueryError) {
    eprintln!("\n\x1b[31m✗ BigQuery Error [{}]\x1b[0m", err.error_code());
    eprintln!("  {}", err);
    eprintln!("\n\x1b[33mSuggestion:\x1b[0m");
    for line in err.suggestion().lines() {
        eprintln!("  {}", line);
    }
    eprintln!();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = DriverConfig::from_env(&cli.data_source)?;
    let driver = BigQueryDriver::connect(config).await?;
    let output = cli.output;

    match cli.command {
        Commands::TestConnection => {
            driver.test_connection().await?;
            println!("✓ Connection OK");
        }

        Commands::Query { sql, params, stream } => {
            let params: Vec<Value> = params.into_iter().map(Value::String).collect();
            let rows = if stream {
                let result = driver.stream(&sql, &params).await?;
                let rows: Vec<Row> = result.rows.try_collect().await?;
                result.release.release();
                rows
            } else {
                driver.memory(&sql, &params).await?.rows
            };
            info!("{} rows", rows.len());
            print_rows(&rows, output)?;
        }

        Commands::Types { sql } => {
            let types = driver.column_types_for_query(&sql).await?;
            print_types(&types, output)?;
        }

        Commands::TableTypes { table } => {
            let types = driver.column_types_for_table(&table).await?;
            print_types(&types, output)?;
        }

        Commands::Tables { dataset } => {
            let tables = driver.list_tables(&dataset).await?;
            match output {
                OutputFormat::Table => {
                    if tables.is_empty() {
                        println!("No tables in {}", dataset);
                    }
                    for table in tables {
                        println!("{}", table);
                    }
                }
                _ => print_serialized(&tables, output)?,
            }
        }

        Commands::Schema => {
            let schema = driver.tables_schema().await?;
            let rows: Vec<SchemaRow> = schema
                .iter()
                .flat_map(|(dataset, tables)| {
                    tables.iter().flat_map(move |(table, columns)| {
                        columns.iter().map(move |c| SchemaRow {
                            dataset: dataset.clone(),
                            table: table.clone(),
                            column: c.name.clone(),
                            data_type: c.data_type.clone(),
                            generic: c.generic_type.to_string(),
                        })
                    })
                })
                .collect();

            match output {
                OutputFormat::Table => print_table(Table::new(rows)),
                _ => print_serialized(&schema, output)?,
            }
        }

        Commands::Unload { table, sql } => {
            if !driver.is_unload_supported() {
                return Err("Export bucket is not configured (CUBEJS_DB_EXPORT_BUCKET)".into());
            }
            let options = UnloadOptions {
                query: sql.map(|sql| UnloadQuery { sql, params: Vec::new() }),
                ..Default::default()
            };
            let result = driver.unload(&table, &options).await?;

            match output {
                OutputFormat::Table => {
                    println!("\nUnloaded {} ({} files)\n", result.table, result.csv_file.len());
                    print_types(&result.types, output)?;
                    println!();
                    for url in &result.csv_file {
                        println!("{}", url);
                    }
                }
                _ => print_serialized(&result, output)?,
            }
        }
    }

    Ok(())
}

fn print_table(mut table: Table) {
    table.with(Style::markdown());
    println!("{}", table);
}

fn print_serialized<T: Serialize>(value: &T, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn print_types(types: &[ColumnType], output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Table => {
            print_table(Table::new(types.iter().map(TypeRow::from)));
            Ok(())
        }
        _ => print_serialized(&types.iter().map(TypeRow::from).collect::<Vec<_>>(), output),
    }
}

fn print_rows(rows: &[Row], output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Table => {
            let Some(first) = rows.first() else {
                println!("(no rows)");
                return Ok(());
            };

            let mut builder = Builder::default();
            builder.push_record(first.keys().cloned());
            for row in rows {
                builder.push_record(row.values().map(cell_text));
            }
            print_table(builder.build());
            Ok(())
        }
        _ => print_serialized(&rows, output),
    }
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
