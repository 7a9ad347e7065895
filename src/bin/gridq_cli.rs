use std::{
    error::Error,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Parser;

use gridq::{
    NodeConfig, QueryClient, QueryKind, QueryRequest,
    marshal::QueryArg,
    protocol::{PageEvent, QueryState},
};

#[derive(Debug, Parser)]
#[command(version, about = "Runs a scan query against a gridq node", long_about = None)]
struct Cli {
    /// Address of the node to query
    address: SocketAddr,
    /// Cache to scan
    #[arg(long, default_value = "people")]
    cache: String,
    /// Path to the node configuration file
    #[arg(long, default_value = "gridq.toml")]
    config: PathBuf,
    #[arg(long)]
    page_size: Option<i32>,
    /// Let the node stream every page without waiting for pulls
    #[arg(long)]
    all_pages: bool,
    /// Stop after the first row
    #[arg(long)]
    single: bool,
    /// Ask for column descriptors with the first page
    #[arg(long)]
    metadata: bool,
}

fn render(value: &QueryArg) -> String {
    match value {
        QueryArg::Null => "null".into(),
        QueryArg::Bool(v) => v.to_string(),
        QueryArg::Int(v) => v.to_string(),
        QueryArg::Long(v) => v.to_string(),
        QueryArg::Double(v) => v.to_string(),
        QueryArg::Text(v) => v.clone(),
        QueryArg::Bytes(v) => format!("<{} bytes>", v.len()),
    }
}

fn print_event(event: &PageEvent) {
    match event {
        PageEvent::Page {
            page,
            rows,
            metadata,
            ..
        } => {
            if let Some(columns) = metadata {
                let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
                println!("{}", names.join("\t"));
            }
            for row in rows {
                let cells: Vec<_> = row.iter().map(render).collect();
                println!("{}", cells.join("\t"));
            }
            println!("-- page {page} ({} rows)", rows.len());
        }
        PageEvent::Failed { cause, .. } => eprintln!("query failed: {cause}"),
        PageEvent::Ignored { .. } => {}
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.config)?;

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

    let mut client = QueryClient::connect(cli.address, config.marshaller(), config.window_size)?;
    let request = QueryRequest::builder(client.next_id(), cli.cache)
        .kind(QueryKind::Scan)
        .page_size(cli.page_size.unwrap_or(config.default_page_size))
        .all_pages(cli.all_pages)
        .single(cli.single)
        .include_metadata(cli.metadata)
        .build()?;

    match client.run_query(request, &interrupt, print_event)? {
        QueryState::Cancelled => eprintln!("query cancelled"),
        state => log::debug!("query finished in state {state:?}"),
    }
    Ok(())
}
