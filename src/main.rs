use anyhow::Result;
use clap::{Parser, Subcommand};
use invoice_rag::commands::{add_document, clear_store, query, show_status};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "invoice-rag")]
#[command(about = "Similarity retrieval store for processed invoice documents")]
#[command(version)]
struct Cli {
    /// Storage directory (defaults to ~/.invoice-rag)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the health and size of the store
    Status,
    /// Add a document to the store
    Add {
        /// Path to the document text file
        text_file: PathBuf,
        /// Path to a JSON object of extracted fields
        #[arg(long)]
        fields: Option<PathBuf>,
        /// Path to a JSON object of caller metadata
        #[arg(long)]
        metadata: Option<PathBuf>,
    },
    /// Retrieve similar documents and print the prompt context
    Query {
        /// Path to the query text file
        text_file: PathBuf,
        /// Path to a JSON object of extracted fields
        #[arg(long)]
        fields: Option<PathBuf>,
        /// Number of similar documents to retrieve
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Delete every stored document
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => show_status(cli.dir)?,
        Commands::Add {
            text_file,
            fields,
            metadata,
        } => add_document(cli.dir, &text_file, fields.as_deref(), metadata.as_deref())?,
        Commands::Query {
            text_file,
            fields,
            k,
        } => query(cli.dir, &text_file, fields.as_deref(), k)?,
        Commands::Clear { yes } => clear_store(cli.dir, yes)?,
    }

    Ok(())
}
